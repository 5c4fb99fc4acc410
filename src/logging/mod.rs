//! Инициализация структурного логирования через `tracing-subscriber`.
//!
//! - `config`: конфигурация уровней, консольного и файлового вывода;
//! - `filters`: сборка `EnvFilter` (`RUST_LOG` важнее конфигурации);
//! - `formatter`: fmt-layer в формате pretty/compact/json;
//! - `sinks`: консольный и файловый (tracing-appender) выводы;
//! - `handle`: guard файлового вывода.

pub mod config;
mod filters;
mod formatter;
pub mod handle;
pub mod sinks;

use busmux_error::{GenericError, MuxResult, StatusCode};
pub use config::{ConsoleConfig, FileConfig, LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Пишет событие `tracing` на уровне, который задаёт [`LogLevel`] ошибки.
///
/// [`LogLevel`]: busmux_error::LogLevel
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            busmux_error::LogLevel::Debug => tracing::debug!($($arg)+),
            busmux_error::LogLevel::Info => tracing::info!($($arg)+),
            busmux_error::LogLevel::Warn => tracing::warn!($($arg)+),
            busmux_error::LogLevel::Error => tracing::error!($($arg)+),
        }
    };
}
pub(crate) use event_at;

/// Устанавливает глобальный подписчик `tracing` по конфигурации.
///
/// Возвращает ошибку, если конфигурация некорректна или глобальный
/// подписчик уже установлен.
pub fn init_logging(config: LoggingConfig) -> MuxResult<LoggingHandle> {
    config.validate()?;
    config.ensure_log_dir()?;

    let env_filter = filters::build_filter_from_config(&config);
    let mut layers = Vec::new();

    if config.console.enabled {
        layers.push(sinks::console::layer_with_config(&config));
    }

    let file_guard = if config.file.enabled {
        let (file_layer, guard) = sinks::file::layer_with_config(&config);
        layers.push(file_layer);
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| {
            GenericError::new(
                StatusCode::InvalidConfig,
                format!("Logging is already initialized: {e}"),
            )
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        console_enabled = config.console.enabled,
        file_enabled = config.file.enabled,
        "Logging system initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}
