//! Observability: structured logging, metrics, events, and request context.

mod event_bus;
mod metrics;
mod request_context;

pub use event_bus::{EventBus, FilteredReceiver};
pub use metrics::install_prometheus;
pub use request_context::{
    REQUEST_ID_HEADER, RequestContext, current_request_id, scope_request_context,
};

use crate::config::{LogFormat, LoggingSettings, MetricsSettings};
use crate::{Error, Result};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Options for process-level initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Whether verbose output was requested via CLI.
    pub verbose: bool,
    /// Whether to expose metrics via HTTP listener.
    pub metrics_expose: bool,
}

static OBSERVABILITY_INIT: OnceLock<()> = OnceLock::new();

/// Builds the log filter from settings.
///
/// `--verbose` raises the crate's own level to `debug` without touching
/// other targets.
fn build_filter(settings: &LoggingSettings, verbose: bool) -> EnvFilter {
    let directives = if verbose {
        format!("{},bookshelf=debug", settings.filter)
    } else {
        settings.filter.clone()
    };
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        tracing::warn!(error = %e, directives = %directives, "Invalid log filter, using 'info'");
        EnvFilter::new("info")
    })
}

/// Initializes logging and metrics for the process.
///
/// # Errors
///
/// Returns an error if observability has already been initialized or if the
/// metrics exporter cannot be installed.
pub fn init(
    logging: &LoggingSettings,
    metrics: &MetricsSettings,
    options: InitOptions,
) -> Result<()> {
    if OBSERVABILITY_INIT.get().is_some() {
        return Err(Error::OperationFailed {
            operation: "observability_init".to_string(),
            cause: "observability already initialized".to_string(),
        });
    }

    let metrics_enabled = install_prometheus(metrics, options.metrics_expose)?;
    let filter = build_filter(logging, options.verbose);

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true),
                )
                .with(filter)
                .try_init()
                .map_err(init_error)?;
        },
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .with(filter)
                .try_init()
                .map_err(init_error)?;
        },
    }

    OBSERVABILITY_INIT
        .set(())
        .map_err(|()| Error::OperationFailed {
            operation: "observability_init".to_string(),
            cause: "failed to mark observability initialized".to_string(),
        })?;

    tracing::debug!(
        format = logging.format.as_str(),
        metrics_enabled,
        "Observability initialized"
    );
    Ok(())
}

/// Helper to convert init errors.
#[allow(clippy::needless_pass_by_value)]
fn init_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::OperationFailed {
        operation: "observability_init".to_string(),
        cause: e.to_string(),
    }
}
