//! Observability infrastructure for Capstan.
//!
//! Structured logging with consistent spans across the engine.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

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
/// Call once at startup. Safe to call multiple times; subsequent calls
/// are no-ops. `RUST_LOG` controls levels.
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

/// Creates a span for run-scoped engine operations.
#[must_use]
pub fn run_span(operation: &str, run_id: &str) -> Span {
    tracing::info_span!("run", op = operation, run_id = run_id)
}

/// Creates a span for task-scoped engine operations.
#[must_use]
pub fn task_span(operation: &str, run_id: &str, task_id: &str) -> Span {
    tracing::info_span!("task", op = operation, run_id = run_id, task_id = task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = run_span("tick", "run_123");
        let _guard = span.enter();
        tracing::info!("message in run span");
    }
}
