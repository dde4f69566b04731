use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "roster-sync.log";

/// Flushes the non-blocking file writer when dropped.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

/// Installs the global subscriber: stdout always, plus a daily rolling file
/// when enabled. Hold the returned guard until the process exits.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<FileLogGuard>, TryInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true);

    let mut guard = None;
    let file_layer = if config.file_logs {
        match std::fs::create_dir_all(&config.log_dir) {
            Ok(()) => {
                let appender =
                    RollingFileAppender::new(Rotation::DAILY, &config.log_dir, LOG_FILE_PREFIX);
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                guard = Some(FileLogGuard {
                    _guard: worker_guard,
                });
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(err) => {
                eprintln!(
                    "failed to create log directory {}: {err}",
                    config.log_dir.display()
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
