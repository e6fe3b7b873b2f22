//! Prometheus metrics.

use crate::config::MetricsSettings;
use crate::{Error, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Installs the Prometheus metrics recorder and, optionally, its listener.
///
/// Returns `false` when metrics are disabled; the `metrics` macros are then
/// no-ops.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be started.
pub fn install_prometheus(config: &MetricsSettings, expose: bool) -> Result<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let builder = PrometheusBuilder::new();
    if expose {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        let (recorder, exporter) = builder
            .with_http_listener(addr)
            .build()
            .map_err(|e| Error::OperationFailed {
                operation: "metrics_listener_build".to_string(),
                cause: e.to_string(),
            })?;
        ::metrics::set_global_recorder(recorder).map_err(|e| Error::OperationFailed {
            operation: "metrics_recorder_install".to_string(),
            cause: e.to_string(),
        })?;
        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::warn!(error = ?e, "Prometheus listener stopped");
            }
        });
        tracing::info!(%addr, "Prometheus metrics listener started");
    } else {
        builder
            .install_recorder()
            .map_err(|e| Error::OperationFailed {
                operation: "metrics_recorder_install".to_string(),
                cause: e.to_string(),
            })?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let settings = MetricsSettings {
            enabled: false,
            port: 0,
        };
        assert!(!install_prometheus(&settings, true).unwrap());
    }
}
