//! File logging for the CLI. Stdout carries command output only.

use handoff_core::StorageConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "handoff.log";

/// Installs a daily-rolling file subscriber. The returned guard flushes on
/// drop and must live until exit. Returns `None` when the log directory
/// cannot be created; the CLI then runs without logging.
pub fn init(storage: &StorageConfig) -> Option<WorkerGuard> {
    let dir = storage.logs_dir();
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .try_init()
        .ok()?;

    Some(guard)
}
