use std::fs::OpenOptions;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "signet_core=info,signet_cli=info,signet=info";
const LOG_FILE_ENV: &str = "SIGNET_LOG_FILE";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: human-readable logs on stderr, plus a debug
/// log file when `SIGNET_LOG_FILE` is set.
pub fn init_tracing() -> Result<()> {
    // stdout carries command output
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter());

    let registry = tracing_subscriber::registry().with(stderr_layer);

    if let Ok(log_path) = std::env::var(LOG_FILE_ENV) {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {}", log_path))?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);

        registry
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        eprintln!("File logging enabled: {}", log_path);
    } else {
        registry
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }
    Ok(())
}
