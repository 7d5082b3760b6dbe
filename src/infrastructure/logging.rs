use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{AppResult, ResultExt};

const DEFAULT_LEVEL: &str = "info";

/// Keeps the non-blocking writer alive; drop it and buffered log lines are
/// lost.
pub struct LoggingGuard {
    log_dir: PathBuf,
    level: String,
    _worker: WorkerGuard,
}

impl LoggingGuard {
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn level(&self) -> &str {
        &self.level
    }
}

fn resolve_log_level() -> String {
    std::env::var("NETSHARE_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
}

/// Install an EnvFilter-governed subscriber: JSON daily-rolling file layer,
/// plus a compact stderr layer in debug builds. Idempotent when a global
/// dispatcher is already set.
pub fn init_logging(data_dir: &Path) -> AppResult<LoggingGuard> {
    let log_dir = data_dir.join("logs");
    fs::create_dir_all(&log_dir)
        .with_code("IO_ERROR", "log directory create failed")
        .with_ctx("logDir", log_dir.display().to_string())?;

    let file_appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("netshare")
        .filename_suffix("log")
        .build(&log_dir)
        .with_code("IO_ERROR", "log appender create failed")
        .with_ctx("logDir", log_dir.display().to_string())?;
    let (file_writer, worker_guard) = tracing_appender::non_blocking(file_appender);

    let level = resolve_log_level();
    if !tracing::dispatcher::has_been_set() {
        let env_filter = EnvFilter::new(level.clone());
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(file_writer)
            .with_current_span(false)
            .with_span_list(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer);
        #[cfg(debug_assertions)]
        let subscriber = subscriber.with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_writer(std::io::stderr)
                .with_target(true),
        );

        subscriber
            .try_init()
            .with_code("INTERNAL_ERROR", "log subscriber init failed")
            .with_ctx("logLevel", level.clone())?;
    }

    Ok(LoggingGuard {
        log_dir,
        level,
        _worker: worker_guard,
    })
}
