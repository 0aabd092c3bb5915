use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::LoggingConfig;

/// Initialize structured logging on stderr.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_telemetry(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    tracing::debug!(level = %logging.level, json = logging.json, "logging initialized");
    Ok(())
}

/// Generate a correlation ID for linking the log lines of one run
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
