//! provides logging helpers

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Directory for the rolling run log. Unset means stderr only.
pub const LOG_PATH_ENV_VAR: &str = "NPU_PLUGIN_LOG_PATH";

const LOG_FILE_PREFIX: &str = "npu-device-plugin.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// Initiate the global subscriber, adding a daily rotated file layer when
/// [`LOG_PATH_ENV_VAR`] points at a directory.
///
/// The returned guard must stay alive for buffered lines to be flushed.
pub fn init_with_file() -> Option<WorkerGuard> {
    let Some(log_dir) = env::var(LOG_PATH_ENV_VAR).ok().filter(|p| !p.is_empty()) else {
        init();
        return None;
    };

    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    match file_appender(Path::new(&log_dir)) {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(stderr_layer).with(file_layer).init();
            Some(guard)
        }
        Err(e) => {
            registry().with(stderr_layer).init();
            tracing::warn!("failed to create log file appender in {log_dir}: {e}");
            None
        }
    }
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(3)
        .build(dir)
}
