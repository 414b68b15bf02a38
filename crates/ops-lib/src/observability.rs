//! Prometheus metrics and event logging for port-forwards and cluster reports

use crate::error::OpsError;
use crate::portforward::{CloseOutcome, SessionSummary};
use crate::report::ClusterResourceReport;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for report generation time, in seconds
const REPORT_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

static GLOBAL_METRICS: OnceLock<OpsMetricsInner> = OnceLock::new();

struct OpsMetricsInner {
    port_forwards_active: IntGauge,
    port_forwards_opened: IntCounter,
    port_forwards_closed: IntCounter,
    port_forward_failures: IntCounterVec,
    report_duration_seconds: Histogram,
    live_metrics_unavailable: IntCounter,
    upstream_failures: IntCounter,
}

impl OpsMetricsInner {
    fn new() -> Self {
        Self {
            port_forwards_active: register_int_gauge!(
                "clusterops_port_forwards_active",
                "Port-forward sessions with a running process"
            )
            .expect("Failed to register port_forwards_active"),

            port_forwards_opened: register_int_counter!(
                "clusterops_port_forwards_opened_total",
                "Port-forwards that survived their startup grace period"
            )
            .expect("Failed to register port_forwards_opened"),

            port_forwards_closed: register_int_counter!(
                "clusterops_port_forwards_closed_total",
                "Port-forward sessions removed by a stop request"
            )
            .expect("Failed to register port_forwards_closed"),

            port_forward_failures: register_int_counter_vec!(
                "clusterops_port_forward_failures_total",
                "Failed port-forward operations by error kind",
                &["kind"]
            )
            .expect("Failed to register port_forward_failures"),

            report_duration_seconds: register_histogram!(
                "clusterops_cluster_report_duration_seconds",
                "Time spent building a cluster resource report",
                REPORT_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register report_duration_seconds"),

            live_metrics_unavailable: register_int_counter!(
                "clusterops_live_metrics_unavailable_total",
                "Node rows reported as N/A because live metrics were unavailable"
            )
            .expect("Failed to register live_metrics_unavailable"),

            upstream_failures: register_int_counter!(
                "clusterops_upstream_failures_total",
                "Cluster API calls that failed"
            )
            .expect("Failed to register upstream_failures"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same series
#[derive(Clone)]
pub struct OpsMetrics {
    _private: (),
}

impl Default for OpsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OpsMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OpsMetricsInner {
        GLOBAL_METRICS.get_or_init(OpsMetricsInner::new)
    }

    pub fn set_active_port_forwards(&self, count: usize) {
        self.inner().port_forwards_active.set(count as i64);
    }

    pub fn inc_opened(&self) {
        self.inner().port_forwards_opened.inc();
    }

    pub fn inc_closed(&self) {
        self.inner().port_forwards_closed.inc();
    }

    /// Count a failed open/stop under the error's kind
    pub fn record_failure(&self, error: &OpsError) {
        self.inner()
            .port_forward_failures
            .with_label_values(&[error.kind()])
            .inc();
    }

    pub fn observe_report_duration(&self, duration_secs: f64) {
        self.inner().report_duration_seconds.observe(duration_secs);
    }

    pub fn add_live_metrics_unavailable(&self, rows: usize) {
        self.inner().live_metrics_unavailable.inc_by(rows as u64);
    }

    pub fn inc_upstream_failures(&self) {
        self.inner().upstream_failures.inc();
    }
}

/// Encode every registered metric in the Prometheus text format
pub fn gather_text() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

/// Event-tagged log records for the ops server
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, port: u16) {
        info!(
            event = "server_started",
            instance = %self.instance,
            version = %version,
            port = port,
            "clusterops server started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, stopped_sessions: usize) {
        info!(
            event = "server_shutdown",
            instance = %self.instance,
            reason = %reason,
            stopped_sessions = stopped_sessions,
            "clusterops server shutting down"
        );
    }

    pub fn log_port_forward_opened(&self, session: &SessionSummary) {
        info!(
            event = "port_forward_opened",
            instance = %self.instance,
            local_port = session.local_port,
            remote_port = session.remote_port,
            target = %format!("{}/{}", session.resource_type, session.resource_name),
            namespace = %session.namespace,
            pid = ?session.pid,
            "Port-forward opened"
        );
    }

    pub fn log_port_forward_closed(&self, local_port: u16, outcome: CloseOutcome) {
        info!(
            event = "port_forward_closed",
            instance = %self.instance,
            local_port = local_port,
            outcome = ?outcome,
            "Port-forward closed"
        );
    }

    pub fn log_port_forward_failed(&self, local_port: u16, error: &OpsError) {
        warn!(
            event = "port_forward_failed",
            instance = %self.instance,
            local_port = local_port,
            kind = error.kind(),
            error = %error,
            "Port-forward operation failed"
        );
    }

    pub fn log_report(&self, report: &ClusterResourceReport, duration_secs: f64) {
        if report.live_metrics_unavailable > 0 {
            warn!(
                event = "cluster_report_generated",
                instance = %self.instance,
                nodes = report.nodes.len(),
                pods = report.pods.used,
                live_metrics_unavailable = report.live_metrics_unavailable,
                duration_secs = duration_secs,
                "Cluster report generated with missing live metrics"
            );
        } else {
            info!(
                event = "cluster_report_generated",
                instance = %self.instance,
                nodes = report.nodes.len(),
                pods = report.pods.used,
                duration_secs = duration_secs,
                "Cluster report generated"
            );
        }
    }

    pub fn log_upstream_failure(&self, error: &OpsError) {
        warn!(
            event = "upstream_unavailable",
            instance = %self.instance,
            error = %error,
            "Cluster API unavailable"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let metrics = OpsMetrics::new();
        metrics.set_active_port_forwards(2);
        metrics.inc_opened();
        metrics.record_failure(&OpsError::NotFound { local_port: 8080 });
        metrics.observe_report_duration(0.2);
        metrics.add_live_metrics_unavailable(1);

        let text = String::from_utf8(gather_text().unwrap()).unwrap();
        assert!(text.contains("clusterops_port_forwards_active"));
        assert!(text.contains("clusterops_port_forward_failures_total{kind=\"not_found\"}"));
    }

    #[test]
    fn test_handles_share_series() {
        let a = OpsMetrics::new();
        let b = a.clone();
        a.inc_upstream_failures();
        b.inc_upstream_failures();
        assert!(GLOBAL_METRICS.get().unwrap().upstream_failures.get() >= 2);
    }
}
