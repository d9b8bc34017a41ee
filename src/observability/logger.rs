use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogRotation;

const LOG_FILE_PREFIX: &str = "orgvault.log";

/// Handle to the buffered file writer.
///
/// Dropping it flushes whatever the writer thread still holds; the caller
/// keeps it alive until the run is over.
#[derive(Default)]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Console output is always on;
/// a configured log directory adds a rolling file layer on top.
pub fn init_logging(
    level: &str,
    log_dir: Option<&Path>,
    rotation: &LogRotation,
) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    let Some(dir) = log_dir else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Tracing subscriber already installed: {}", e))?;
        return Ok(LogGuard::default());
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create log directory {}", dir.display()))?;

    let appender = match rotation {
        LogRotation::Daily => tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX),
        LogRotation::Hourly => tracing_appender::rolling::hourly(dir, LOG_FILE_PREFIX),
        LogRotation::Never => tracing_appender::rolling::never(dir, LOG_FILE_PREFIX),
    };
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false);

    registry
        .with(file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Tracing subscriber already installed: {}", e))?;

    Ok(LogGuard {
        _worker: Some(worker),
    })
}
