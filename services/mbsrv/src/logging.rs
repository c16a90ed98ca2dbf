use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::{parse_level, LogConfig};
use crate::error::{MbsrvError, Result};

/// Initialize the global logger
///
/// Logs go to the console unless `config.dir` is set and `config.console` is off, in
/// which case they go to a daily rolling file `{service_name}.log` in that directory.
/// `RUST_LOG`, when present, overrides the configured level.
///
/// The returned guard flushes the file writer on drop and must be held for the life of
/// the process.
pub fn init_logging(config: &LogConfig, service_name: &str) -> Result<Option<WorkerGuard>> {
    let level = parse_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    match &config.dir {
        Some(dir) if !config.console => {
            std::fs::create_dir_all(dir)?;
            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, dir, format!("{}.log", service_name));
            let (writer, guard) = tracing_appender::non_blocking(file_appender);

            fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| MbsrvError::config(format!("Failed to init logging: {}", e)))?;

            tracing::info!(
                "Logger initialized for service: {} (file mode, {})",
                service_name,
                dir.display()
            );
            Ok(Some(guard))
        },
        _ => {
            fmt()
                .with_env_filter(env_filter)
                .try_init()
                .map_err(|e| MbsrvError::config(format!("Failed to init logging: {}", e)))?;

            tracing::info!("Logger initialized for service: {} (console mode)", service_name);
            Ok(None)
        },
    }
}
