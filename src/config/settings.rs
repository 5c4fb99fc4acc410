use std::time::Duration;

use busmux_error::{ensure, GenericError, MuxResult, StatusCode};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::{logging::LoggingConfig, pubsub::Backoff};

/// Префикс переменных окружения.
pub const ENV_PREFIX: &str = "BUSMUX";

/// Конфигурация мультиплексора.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Базовая задержка backoff (мс)
    pub backoff_base_ms: u64,
    /// Потолок задержки backoff (мс)
    pub backoff_max_ms: u64,
    /// Предел счётчика попыток; по умолчанию вычисляется из base и max
    pub backoff_attempt_cap: Option<u32>,
    /// Таймаут одной попытки подключения (мс)
    pub connect_timeout_ms: u64,
    pub logging: LoggingConfig,
}

impl MultiplexerConfig {
    /// Загружает конфигурацию: значения по умолчанию, поверх них
    /// переменные окружения `BUSMUX_*` (вложенные поля через `__`,
    /// например `BUSMUX_LOGGING__LEVEL=debug`).
    pub fn load() -> MuxResult<Self> {
        let cfg = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(invalid_config)?;

        let config: Self = cfg.try_deserialize().map_err(invalid_config)?;
        config.validate()?;
        Ok(config)
    }

    /// Проверяет согласованность значений.
    pub fn validate(&self) -> MuxResult<()> {
        ensure!(
            self.backoff_base_ms > 0,
            StatusCode::InvalidConfig,
            "backoff_base_ms must be positive"
        );
        ensure!(
            self.backoff_max_ms >= self.backoff_base_ms,
            StatusCode::InvalidConfig,
            "backoff_max_ms ({}) must not be less than backoff_base_ms ({})",
            self.backoff_max_ms,
            self.backoff_base_ms
        );
        ensure!(
            self.connect_timeout_ms > 0,
            StatusCode::InvalidConfig,
            "connect_timeout_ms must be positive"
        );
        self.logging.validate()
    }

    /// Политика backoff из конфигурации.
    pub fn backoff(&self) -> Backoff {
        let backoff = Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        );
        match self.backoff_attempt_cap {
            Some(cap) => backoff.with_attempt_cap(cap),
            None => backoff,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: Backoff::DEFAULT_BASE.as_millis() as u64,
            backoff_max_ms: Backoff::DEFAULT_CEILING.as_millis() as u64,
            backoff_attempt_cap: None,
            connect_timeout_ms: 5_000,
            logging: LoggingConfig::default(),
        }
    }
}

fn invalid_config(err: config::ConfigError) -> GenericError {
    GenericError::new(StatusCode::InvalidConfig, format!("Invalid configuration: {err}"))
}
