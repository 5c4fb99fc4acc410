use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{layer::Layer as LayerTrait, registry::LookupSpan};

use crate::logging::{config::LoggingConfig, formatter};

/// File layer с ежедневной ротацией и неблокирующей записью.
///
/// Guard нужно держать до конца работы: при его сбросе буфер сливается
/// в файл.
pub fn layer_with_config<S>(
    config: &LoggingConfig
) -> (Box<dyn LayerTrait<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = rolling::daily(&config.file.directory, &config.file.filename);
    let (writer, guard) = non_blocking(appender);
    let layer = formatter::build_layer(config.file.format, &config.console, writer, false);
    (layer, guard)
}
