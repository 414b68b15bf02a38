//! Cluster resource report
//!
//! Sums node capacity/allocatable and pod requests/limits into cluster-wide
//! totals, with a per-node breakdown and an optional live usage row.
//! Ratios whose denominator is zero are reported as undefined.

use crate::live_metrics::LiveMetricsSource;
use crate::models::{NodeReadiness, NodeResourceFacts, NodeUsage, PodResourceRequest};
use crate::quantity::{cpu_cores, format_cores, format_memory, memory_bytes, pod_slots};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on a single live metrics lookup
pub const DEFAULT_LIVE_METRICS_TIMEOUT: Duration = Duration::from_secs(5);

/// Percentage of `part` in `whole`, undefined when `whole` is zero
pub fn percent_of(part: f64, whole: f64) -> Option<f64> {
    if whole == 0.0 || !whole.is_finite() {
        None
    } else {
        Some(part / whole * 100.0)
    }
}

fn render_percent(value: Option<f64>) -> String {
    match value {
        Some(p) => format!("{:.2}%", p),
        None => "undefined".to_string(),
    }
}

/// Totals for one resource (CPU in cores, memory in bytes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTotals {
    pub capacity: f64,
    pub allocatable: f64,
    pub requests: f64,
    pub limits: f64,
    /// Requests as a percentage of allocatable
    pub requests_percent: Option<f64>,
    /// Limits as a percentage of allocatable
    pub limits_percent: Option<f64>,
}

impl ResourceTotals {
    fn finish(mut self) -> Self {
        self.requests_percent = percent_of(self.requests, self.allocatable);
        self.limits_percent = percent_of(self.limits, self.allocatable);
        self
    }
}

/// Pod slot usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTotals {
    pub capacity: u64,
    pub used: u64,
    pub used_percent: Option<f64>,
}

/// Live usage row for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LiveUsage {
    Available { cpu: String, memory: String },
    Unavailable,
}

impl LiveUsage {
    pub fn cpu(&self) -> &str {
        match self {
            LiveUsage::Available { cpu, .. } => cpu,
            LiveUsage::Unavailable => "N/A",
        }
    }

    pub fn memory(&self) -> &str {
        match self {
            LiveUsage::Available { memory, .. } => memory,
            LiveUsage::Unavailable => "N/A",
        }
    }
}

impl From<NodeUsage> for LiveUsage {
    fn from(usage: NodeUsage) -> Self {
        LiveUsage::Available {
            cpu: usage.cpu,
            memory: usage.memory,
        }
    }
}

/// Per-node breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub name: String,
    pub status: NodeReadiness,
    pub cpu_allocatable: f64,
    pub memory_allocatable: f64,
    /// CPU requested by pods scheduled on this node
    pub cpu_requests: f64,
    /// Memory requested by pods scheduled on this node
    pub memory_requests: f64,
    pub cpu_requests_percent: Option<f64>,
    pub memory_requests_percent: Option<f64>,
    pub live: LiveUsage,
}

/// Cluster-wide utilization report, built fresh for every query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceReport {
    pub generated_at: DateTime<Utc>,
    pub cpu: ResourceTotals,
    pub memory: ResourceTotals,
    pub pods: PodTotals,
    pub nodes: Vec<NodeReport>,
    /// Number of nodes whose live usage could not be read
    pub live_metrics_unavailable: usize,
}

#[derive(Default)]
struct NodeRequests {
    cpu: f64,
    memory: f64,
}

/// Compute the report without consulting any live metrics source
///
/// Every node row gets [`LiveUsage::Unavailable`].
pub fn compute_cluster_report(
    nodes: &[NodeResourceFacts],
    pods: &[PodResourceRequest],
) -> ClusterResourceReport {
    let mut cpu = ResourceTotals::default();
    let mut memory = ResourceTotals::default();
    let mut pod_totals = PodTotals::default();

    for node in nodes {
        cpu.capacity += cpu_cores(&node.capacity.cpu);
        cpu.allocatable += cpu_cores(&node.allocatable.cpu);
        memory.capacity += memory_bytes(&node.capacity.memory);
        memory.allocatable += memory_bytes(&node.allocatable.memory);
        pod_totals.capacity += pod_slots(&node.capacity.pods);
    }

    let mut per_node: HashMap<&str, NodeRequests> = HashMap::new();
    for pod in pods {
        for container in &pod.containers {
            let cpu_request = cpu_cores(&container.requests_cpu);
            let memory_request = memory_bytes(&container.requests_memory);

            cpu.requests += cpu_request;
            cpu.limits += cpu_cores(&container.limits_cpu);
            memory.requests += memory_request;
            memory.limits += memory_bytes(&container.limits_memory);

            if let Some(node_name) = pod.node_name.as_deref() {
                let entry = per_node.entry(node_name).or_default();
                entry.cpu += cpu_request;
                entry.memory += memory_request;
            }
        }
    }

    pod_totals.used = pods.len() as u64;
    pod_totals.used_percent = percent_of(pod_totals.used as f64, pod_totals.capacity as f64);

    let node_reports = nodes
        .iter()
        .map(|node| {
            let cpu_allocatable = cpu_cores(&node.allocatable.cpu);
            let memory_allocatable = memory_bytes(&node.allocatable.memory);
            let requests = per_node.get(node.name.as_str());
            let cpu_requests = requests.map(|r| r.cpu).unwrap_or(0.0);
            let memory_requests = requests.map(|r| r.memory).unwrap_or(0.0);

            NodeReport {
                name: node.name.clone(),
                status: node.readiness,
                cpu_allocatable,
                memory_allocatable,
                cpu_requests,
                memory_requests,
                cpu_requests_percent: percent_of(cpu_requests, cpu_allocatable),
                memory_requests_percent: percent_of(memory_requests, memory_allocatable),
                live: LiveUsage::Unavailable,
            }
        })
        .collect::<Vec<_>>();

    ClusterResourceReport {
        generated_at: Utc::now(),
        cpu: cpu.finish(),
        memory: memory.finish(),
        pods: pod_totals,
        live_metrics_unavailable: node_reports.len(),
        nodes: node_reports,
    }
}

/// Configuration for the resource aggregator
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Bound on each per-node live metrics lookup
    pub live_metrics_timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            live_metrics_timeout: DEFAULT_LIVE_METRICS_TIMEOUT,
        }
    }
}

/// Builds cluster reports, optionally enriched with live node usage
#[derive(Clone, Default)]
pub struct ResourceAggregator {
    live_metrics: Option<Arc<dyn LiveMetricsSource>>,
    config: ReportConfig,
}

impl ResourceAggregator {
    pub fn new(live_metrics: Option<Arc<dyn LiveMetricsSource>>, config: ReportConfig) -> Self {
        Self {
            live_metrics,
            config,
        }
    }

    /// Whether a live metrics source is configured
    pub fn has_live_metrics(&self) -> bool {
        self.live_metrics.is_some()
    }

    /// Compute the report, then fill in live usage node by node
    ///
    /// A failed or timed-out lookup marks only that node's row `N/A`.
    pub async fn compute_report(
        &self,
        nodes: &[NodeResourceFacts],
        pods: &[PodResourceRequest],
    ) -> ClusterResourceReport {
        let mut report = compute_cluster_report(nodes, pods);

        let Some(source) = &self.live_metrics else {
            return report;
        };

        let mut unavailable = 0;
        for row in &mut report.nodes {
            let lookup = tokio::time::timeout(
                self.config.live_metrics_timeout,
                source.node_utilization(&row.name),
            )
            .await;

            row.live = match lookup {
                Ok(Ok(usage)) => usage.into(),
                Ok(Err(e)) => {
                    debug!(node = %row.name, error = %e, "Live metrics unavailable");
                    unavailable += 1;
                    LiveUsage::Unavailable
                }
                Err(_) => {
                    warn!(node = %row.name, "Live metrics lookup timed out");
                    unavailable += 1;
                    LiveUsage::Unavailable
                }
            };
        }
        report.live_metrics_unavailable = unavailable;

        report
    }
}

impl fmt::Display for ClusterResourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CLUSTER METRICS:")?;

        writeln!(f, "\nCPU:")?;
        writeln!(f, "  Capacity:    {}", format_cores(self.cpu.capacity))?;
        writeln!(f, "  Allocatable: {}", format_cores(self.cpu.allocatable))?;
        writeln!(
            f,
            "  Requests:    {} ({} of allocatable)",
            format_cores(self.cpu.requests),
            render_percent(self.cpu.requests_percent)
        )?;
        writeln!(
            f,
            "  Limits:      {} ({} of allocatable)",
            format_cores(self.cpu.limits),
            render_percent(self.cpu.limits_percent)
        )?;

        writeln!(f, "\nMemory:")?;
        writeln!(f, "  Capacity:    {}", format_memory(self.memory.capacity))?;
        writeln!(f, "  Allocatable: {}", format_memory(self.memory.allocatable))?;
        writeln!(
            f,
            "  Requests:    {} ({} of allocatable)",
            format_memory(self.memory.requests),
            render_percent(self.memory.requests_percent)
        )?;
        writeln!(
            f,
            "  Limits:      {} ({} of allocatable)",
            format_memory(self.memory.limits),
            render_percent(self.memory.limits_percent)
        )?;

        writeln!(f, "\nPods:")?;
        writeln!(f, "  Capacity:    {}", self.pods.capacity)?;
        writeln!(
            f,
            "  Used:        {} ({} of capacity)",
            self.pods.used,
            render_percent(self.pods.used_percent)
        )?;

        writeln!(f, "\nNODE METRICS:")?;
        write!(f, "NAME\tSTATUS\tCPU USED\tMEM USED")?;
        for node in &self.nodes {
            write!(
                f,
                "\n{}\t{}\t{}\t{}",
                node.name,
                node.status,
                node.live.cpu(),
                node.live.memory()
            )?;
        }

        Ok(())
    }
}
