//! Metrics for the Quay controller
//!
//! Thin wrappers over the `metrics` facade. With the `metrics-prometheus`
//! feature disabled every call compiles to nothing.
//!
//! ```rust,ignore
//! use quay_cluster::observability::{init_metrics, ApplyMetrics, ApplyOutcome};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! ApplyMetrics::record_round("join_server", ApplyOutcome::Committed, elapsed);
//! ```

#![cfg_attr(not(feature = "metrics-prometheus"), allow(unused_variables))]

use crate::error::ProbeFailure;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Probe Metrics
// ============================================================================

/// Membership prober metrics
pub struct ProbeMetrics;

impl ProbeMetrics {
    /// Explicit probe answered
    pub fn record_success(latency: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::counter!("quay_probe_total", "result" => "ok").increment(1);
            metrics::histogram!("quay_probe_latency_seconds").record(latency.as_secs_f64());
        }
    }

    /// Explicit probe failed
    pub fn record_failure(reason: ProbeFailure) {
        #[cfg(feature = "metrics-prometheus")]
        {
            let result = match reason {
                ProbeFailure::NotSent => "not_sent",
                ProbeFailure::NoResponse => "no_response",
            };
            metrics::counter!("quay_probe_total", "result" => result).increment(1);
        }
    }

    /// Tracked and alive member counts after a sweep
    pub fn update_members(total: usize, alive: usize) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::gauge!("quay_members").set(total as f64);
            metrics::gauge!("quay_members_alive").set(alive as f64);
        }
    }
}

// ============================================================================
// Apply Metrics
// ============================================================================

/// How a two-phase round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed,
    Aborted,
}

impl ApplyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyOutcome::Committed => "committed",
            ApplyOutcome::Aborted => "aborted",
        }
    }
}

/// Two-phase applier metrics
pub struct ApplyMetrics;

impl ApplyMetrics {
    /// A round finished
    pub fn record_round(operation: &'static str, outcome: ApplyOutcome, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::counter!(
                "quay_apply_rounds_total",
                "operation" => operation,
                "outcome" => outcome.as_str()
            )
            .increment(1);
            metrics::histogram!("quay_apply_duration_seconds", "operation" => operation)
                .record(duration.as_secs_f64());
        }
    }

    /// Number of targets in a round
    pub fn record_targets(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("quay_apply_targets").record(count as f64);
    }

    /// A mutation was rejected before any prepare went out
    pub fn increment_rejected(operation: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("quay_validation_rejections_total", "operation" => operation)
            .increment(1);
    }
}

// ============================================================================
// Topology Metrics
// ============================================================================

/// Committed topology metrics
pub struct TopologyMetrics;

impl TopologyMetrics {
    /// Committed config version
    pub fn set_config_version(version: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("quay_config_version").set(version as f64);
    }

    /// Configured server and replicaset counts
    pub fn set_counts(servers: usize, replicasets: usize) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::gauge!("quay_servers").set(servers as f64);
            metrics::gauge!("quay_replicasets").set(replicasets as f64);
        }
    }

    /// Failover proposed a new master
    pub fn increment_failovers() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("quay_failovers_total").increment(1);
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start a HTTP server on `addr` serving `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize metrics subsystem
///
/// Call this once at application startup. Safe to call multiple times.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        ProbeMetrics::record_success(Duration::from_millis(3));
        ProbeMetrics::record_failure(ProbeFailure::NoResponse);
        ProbeMetrics::update_members(3, 2);
        ApplyMetrics::record_round("edit_server", ApplyOutcome::Aborted, Duration::from_millis(8));
        ApplyMetrics::record_targets(3);
        TopologyMetrics::set_config_version(4);
        TopologyMetrics::set_counts(3, 2);
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_metrics(None).is_ok());
        assert!(init_metrics(None).is_ok());
    }
}
