//! Tracing subscriber setup.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map the 1 (panic) .. 6 (debug) scale onto tracing levels.
///
/// Tracing has no panic or fatal level, so 1 to 3 all mean errors only.
pub fn level_from_number(level: u8) -> Option<LevelFilter> {
    match level {
        1..=3 => Some(LevelFilter::ERROR),
        4 => Some(LevelFilter::WARN),
        5 => Some(LevelFilter::INFO),
        6 => Some(LevelFilter::DEBUG),
        _ => None,
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: u8, log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_level = level_from_number(level);
    let filter = EnvFilter::builder()
        .with_default_directive(filter_level.unwrap_or(LevelFilter::WARN).into())
        .from_env_lossy();

    let file = log_file
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()?;

    let (stdout_layer, file_layer) = match file {
        Some(f) => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(f)),
            ),
        ),
        None => (Some(tracing_subscriber::fmt::layer()), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    if filter_level.is_none() {
        tracing::warn!("Illegal log level {}, defaulting to 4 (warn)", level);
    }

    Ok(())
}
