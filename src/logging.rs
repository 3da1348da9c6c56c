//! Logging setup
//!
//! Debug builds log to stderr. Release builds write a daily rolling file
//! under `<log_root>/logs`, falling back to the platform data directory.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;

const LOG_FILE_PREFIX: &str = "debugmonitor_core";

/// Install the global subscriber.
///
/// A subscriber that is already installed (e.g. by the host app) is left in
/// place.
pub fn init_logging(log_root: Option<&Path>) -> anyhow::Result<()> {
    let level = resolve_log_level(std::env::var("RUST_LOG").ok().as_deref());

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let log_dir = log_directory(log_root);
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Logging lasts until process exit
        std::mem::forget(guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("Debug monitor core initialized v{}", crate::VERSION);
    Ok(())
}

fn log_directory(log_root: Option<&Path>) -> PathBuf {
    log_root
        .map(Path::to_path_buf)
        .or_else(|| dirs::data_local_dir().map(|dir| dir.join("debug-monitor")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("logs")
}

/// Map a `RUST_LOG` value to a level, defaulting to INFO
pub fn resolve_log_level(value: Option<&str>) -> LevelFilter {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("trace") => LevelFilter::TRACE,
        Some("debug") => LevelFilter::DEBUG,
        Some("info") => LevelFilter::INFO,
        Some("warn") | Some("warning") => LevelFilter::WARN,
        Some("error") => LevelFilter::ERROR,
        Some("off") => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}
