//! Tracing initialization and secret redaction.

pub mod redactor;

pub use redactor::SecretRedactor;

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use crate::domain::models::LoggingConfig;

/// Initialize the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. When `config.dir` is set, a
/// non-blocking file appender is installed and the returned guard must be
/// held for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if config.dir.is_empty() {
        if config.format == "json" {
            fmt().with_env_filter(filter).json().init();
        } else {
            fmt().with_env_filter(filter).init();
        }
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&config.dir, "necrocode.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    if config.format == "json" {
        fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).json().init();
    } else {
        fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
    }
    Ok(Some(guard))
}
