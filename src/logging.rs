//! Tracing subscriber setup

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Base name of the rolling log file
pub const LOG_FILE: &str = "circulation";

/// Initialize console logging and, when a directory is configured, a daily rolling JSON file
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("circulation_server={},tower_http=debug", config.level))
    });

    let console = if config.format.eq_ignore_ascii_case("json") {
        fmt::layer().with_target(true).json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let file = match config.directory.as_deref() {
        Some(dir) => {
            if !Path::new(dir).exists() {
                std::fs::create_dir_all(dir)?;
            }
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .json()
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()?;

    Ok(())
}
