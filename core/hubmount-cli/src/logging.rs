//! Tracing setup: human-readable stderr plus a daily rolling file.
//!
//! `HUBMOUNT_DEBUG_LOG=1` forces debug level; otherwise `RUST_LOG` applies,
//! defaulting to `info`. The file layer is skipped if the logs directory
//! cannot be created.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE: &str = "hubmount.log";

/// Installs the global subscriber. Keep the guard alive until exit so
/// buffered file output is flushed.
pub fn init(logs_dir: Option<&Path>) -> Option<WorkerGuard> {
    let debug_enabled = env::var("HUBMOUNT_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match logs_dir.filter(|dir| fs_err::create_dir_all(*dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
