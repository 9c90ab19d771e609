//! # Tracing Setup
//!
//! Installs the global `tracing` subscriber: human-readable output on stdout
//! and, when a log directory is configured, a daily-rolling plain-text file
//! written through a non-blocking worker. `RUST_LOG` takes precedence over
//! the configured level.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Number of rotated log files kept in the log directory.
const KEEP_LOG_FILES: usize = 7;

#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Used as the log file prefix.
    pub app_name: String,
    /// Default filter directive, e.g. `info` or `lib_sensorhub=debug,info`.
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

/// Keeps the file writer alive. Dropping it flushes buffered lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    file: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn writes_to_file(&self) -> bool {
        self.file.is_some()
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_tracing(settings: &LogSettings) -> Result<LogGuard> {
    let filter = build_filter(&settings.level)?;

    let (file_layer, file_guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(&settings.app_name)
                .filename_suffix("log")
                .max_log_files(KEEP_LOG_FILES)
                .build(dir)
                .context("failed to create rolling log file")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LogGuard { file: file_guard })
}
