//! provides logging helpers

use std::path::Path;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Directory for rolling log files, used when no explicit path is passed to [`init`]
pub const LOG_PATH_ENV_VAR: &str = "DRA_CPU_LOG_PATH";

const LOG_FILE_PREFIX: &str = "cpu-driver.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Splits a log path into the rotation directory and file prefix.
fn rotation_target(log_path: &Path) -> (PathBuf, String) {
    if log_path.is_dir() {
        return (log_path.to_path_buf(), LOG_FILE_PREFIX.to_string());
    }
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(LOG_FILE_PREFIX);
    (dir.to_path_buf(), prefix.to_string())
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When a log path is given (or set through
/// [`LOG_PATH_ENV_VAR`]) they are also written to a daily rolling file; the
/// returned guard must be kept alive for the file writer to flush.
pub fn init<P: AsRef<Path>>(log_path: Option<P>) -> Option<WorkerGuard> {
    let log_path = log_path
        .map(|p| p.as_ref().to_path_buf())
        .or_else(|| std::env::var_os(LOG_PATH_ENV_VAR).map(PathBuf::from));

    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let Some(log_path) = log_path else {
        registry().with(stderr_layer).init();
        return None;
    };

    let (dir, prefix) = rotation_target(&log_path);
    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(&dir)
    {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            registry().with(stderr_layer).with(file_layer).init();
            Some(guard)
        }
        Err(err) => {
            registry().with(stderr_layer).init();
            tracing::error!(
                "failed to create rolling log appender at {}: {err}; logging to stderr only",
                dir.display()
            );
            None
        }
    }
}
