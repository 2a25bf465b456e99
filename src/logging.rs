//! Console and log-file output

use anyhow::Context as _;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name prefix of the daily log files
pub const LOG_FILE_PREFIX: &str = "smtp-forward-proxy";

/// Daily rotating appender under `dir`, created if missing
pub fn file_appender(dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("cannot open log file in {}", dir.display()))
}

/// Install the global subscriber: console always, plus a file in `log_dir`.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the program logs. When the directory is unusable the proxy keeps
/// running with console output only.
pub fn init(filter: EnvFilter, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let appender = log_dir.map(|dir| (dir, file_appender(dir)));

    match appender {
        Some((dir, Ok(appender))) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            tracing::info!("Logging to {}", dir.display());
            Some(guard)
        }
        Some((_, Err(e))) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            tracing::warn!("File logging unavailable, using console only: {:#}", e);
            None
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
