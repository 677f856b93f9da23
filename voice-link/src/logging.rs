use std::fs;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::paths;

/// Initialize the structured logging system.
///
/// Sets up:
/// - File output: rolling log files in `{data_dir}/logs/voice-link.log`
///   with daily rotation, keeping the latest 5 files.
/// - Console output on stderr. stdout carries the host IPC stream and must
///   never receive log lines.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
///
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init() -> anyhow::Result<()> {
    let log_dir = paths::get_log_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("voice-link")
        .filename_suffix("log")
        .max_log_files(5)
        .build(&log_dir)
        .context("Failed to create log file appender")?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .compact();

    // tungstenite logs every frame at debug.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tungstenite=warn,tokio_tungstenite=warn,cpal=warn,rodio=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Logger already initialized")?;

    tracing::info!(log_dir = %log_dir.display(), "Logger initialized");
    Ok(())
}
