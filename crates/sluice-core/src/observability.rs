//! Observability infrastructure for sluice.
//!
//! Structured logging with consistent spans. Every request-scoped log line
//! carries the `request_id` field so a single transform can be followed
//! across the gateway, resolution coordinator, tracker and fleet manager.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sluice_flow=debug`)
///
/// # Example
///
/// ```rust
/// use sluice_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .try_init();
            }
            LogFormat::Pretty => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .try_init();
            }
        }
    });
}

/// Creates a span for request-scoped operations.
///
/// # Example
///
/// ```rust
/// use sluice_core::observability::request_span;
///
/// let span = request_span("submit", "01hx3k5c0d7qz8y9w1v2u3t4s5");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn request_span(operation: &str, request_id: &str) -> Span {
    tracing::info_span!("transform", op = operation, request_id = request_id)
}

/// Creates a span for dataset-scoped operations.
#[must_use]
pub fn dataset_span(operation: &str, dataset_id: i64) -> Span {
    tracing::info_span!("dataset", op = operation, dataset_id = dataset_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn request_span_can_be_entered() {
        let span = request_span("test_operation", "01hx3k5c0d7qz8y9w1v2u3t4s5");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn dataset_span_can_be_entered() {
        let span = dataset_span("lookup", 12);
        let _guard = span.enter();
        tracing::info!("dataset message");
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
