//! Observability infrastructure for scanforge.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so the dispatcher, ingest,
//! and reconciler paths log with the same shape.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `scanforge_engine=debug`)
///
/// # Example
///
/// ```rust
/// use scanforge_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for dispatcher operations with standard fields.
///
/// # Example
///
/// ```rust
/// use scanforge_core::observability::dispatch_span;
///
/// let span = dispatch_span("scan", "01JOB", "primary");
/// let _guard = span.enter();
/// // ... run the scan ...
/// ```
#[must_use]
pub fn dispatch_span(operation: &str, job_id: &str, instance: &str) -> Span {
    tracing::info_span!(
        "dispatch",
        op = operation,
        job_id = job_id,
        instance = instance,
    )
}

/// Creates a span for ingest operations.
#[must_use]
pub fn ingest_span(operation: &str, project_id: &str) -> Span {
    tracing::info_span!("ingest", op = operation, project_id = project_id)
}

/// Creates a span for reconciler sweeps.
#[must_use]
pub fn reconcile_span(operation: &str) -> Span {
    tracing::info_span!("reconcile", op = operation)
}
