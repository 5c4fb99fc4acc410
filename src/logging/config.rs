use std::{collections::BTreeMap, fs, path::PathBuf};

use busmux_error::{ensure, GenericError, MuxResult, StatusCode};
use serde::{Deserialize, Serialize};

/// Допустимые уровни логирования.
const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Формат вывода событий.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Многострочный формат для разработки
    Pretty,
    /// Однострочный формат
    #[default]
    Compact,
    /// Структурированный JSON
    Json,
}

/// Настройки вывода в консоль.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_numbers: bool,
}

/// Настройки вывода в файл (ежедневная ротация, неблокирующая запись).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub filename: String,
    pub format: LogFormat,
}

/// Конфигурация логирования.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Глобальный уровень (`trace`, `debug`, `info`, `warn`, `error`, `off`)
    pub level: String,
    /// Уровни для отдельных модулей, например `busmux::pubsub = "debug"`
    pub module_levels: BTreeMap<String, String>,
    pub console: ConsoleConfig,
    pub file: FileConfig,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl LoggingConfig {
    /// Проверяет корректность конфигурации.
    pub fn validate(&self) -> MuxResult<()> {
        ensure!(
            is_level(&self.level),
            StatusCode::InvalidConfig,
            "Unknown log level '{}'",
            self.level
        );
        for (module, level) in &self.module_levels {
            ensure!(
                is_level(level),
                StatusCode::InvalidConfig,
                "Unknown log level '{}' for module '{}'",
                level,
                module
            );
        }
        if self.file.enabled {
            ensure!(
                !self.file.filename.trim().is_empty(),
                StatusCode::InvalidConfig,
                "Log file name must not be empty"
            );
        }
        Ok(())
    }

    /// Директива для `EnvFilter`: глобальный уровень плюс уровни модулей.
    pub fn build_filter_directive(&self) -> String {
        let mut directive = self.level.to_ascii_lowercase();
        for (module, level) in &self.module_levels {
            directive.push_str(&format!(",{module}={}", level.to_ascii_lowercase()));
        }
        directive
    }

    /// Создаёт каталог для файловых логов, если файловый вывод включён.
    pub fn ensure_log_dir(&self) -> MuxResult<()> {
        if !self.file.enabled {
            return Ok(());
        }
        fs::create_dir_all(&self.file.directory).map_err(|e| {
            GenericError::new(
                StatusCode::InvalidConfig,
                format!(
                    "Cannot create log directory {}: {e}",
                    self.file.directory.display()
                ),
            )
        })?;
        Ok(())
    }
}

fn is_level(level: &str) -> bool {
    LEVELS.contains(&level.to_ascii_lowercase().as_str())
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: LogFormat::Compact,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_line_numbers: false,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("logs"),
            filename: "busmux.log".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            console: ConsoleConfig::default(),
            file: FileConfig::default(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
