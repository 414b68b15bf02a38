//! Tool-facing operations
//!
//! Plain-argument entry points over the port-forward registry and the
//! cluster report, plus the text renderings the tool layer replies with.

use crate::error::OpsResult;
use crate::inventory::ClusterInventory;
use crate::portforward::{
    check_port, CloseOutcome, ForwardTarget, PortForwardRegistry, SessionSummary, TargetKind,
};
use crate::report::{ClusterResourceReport, ResourceAggregator};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Arguments of an open request, as received from a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardRequest {
    /// Name of the pod, service or other resource
    pub resource: String,
    pub local_port: i64,
    pub remote_port: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Defaults to `pod`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

impl PortForwardRequest {
    /// Validate the raw arguments into a target
    pub fn into_target(self, default_namespace: &str) -> OpsResult<ForwardTarget> {
        let local_port = check_port("local_port", self.local_port)?;
        let remote_port = check_port("remote_port", self.remote_port)?;
        let kind = match self.resource_type.as_deref() {
            Some(kind) => kind.parse()?,
            None => TargetKind::default(),
        };
        let namespace = self
            .namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| default_namespace.to_string());

        ForwardTarget::new(kind, self.resource, namespace, local_port, remote_port)
    }
}

/// Result of a cluster metrics request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusterMetricsOutcome {
    Report(ClusterResourceReport),
    /// The cluster reported no nodes at all
    NoNodes,
}

impl fmt::Display for ClusterMetricsOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMetricsOutcome::Report(report) => report.fmt(f),
            ClusterMetricsOutcome::NoNodes => f.write_str("No nodes found in the cluster"),
        }
    }
}

/// The operations exposed to callers, sharing one registry and inventory
#[derive(Clone)]
pub struct OpsTools {
    registry: PortForwardRegistry,
    inventory: Arc<dyn ClusterInventory>,
    aggregator: ResourceAggregator,
    default_namespace: String,
}

impl OpsTools {
    pub fn new(
        registry: PortForwardRegistry,
        inventory: Arc<dyn ClusterInventory>,
        aggregator: ResourceAggregator,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            inventory,
            aggregator,
            default_namespace: default_namespace.into(),
        }
    }

    pub fn registry(&self) -> &PortForwardRegistry {
        &self.registry
    }

    pub fn live_metrics_enabled(&self) -> bool {
        self.aggregator.has_live_metrics()
    }

    pub async fn open_port_forward(&self, request: PortForwardRequest) -> OpsResult<SessionSummary> {
        let target = request.into_target(&self.default_namespace)?;
        self.registry.open(target).await
    }

    pub async fn stop_port_forward(&self, local_port: i64) -> OpsResult<CloseOutcome> {
        let local_port = check_port("local_port", local_port)?;
        self.registry.close(local_port).await
    }

    pub fn list_port_forwards(&self) -> Vec<SessionSummary> {
        self.registry.list()
    }

    /// Drop sessions whose process has exited and return them
    pub fn prune_port_forwards(&self) -> Vec<SessionSummary> {
        self.registry.prune()
    }

    /// List nodes and pods, then build the report
    pub async fn get_cluster_metrics(&self) -> OpsResult<ClusterMetricsOutcome> {
        let nodes = self.inventory.list_nodes().await?;
        if nodes.is_empty() {
            return Ok(ClusterMetricsOutcome::NoNodes);
        }
        let pods = self.inventory.list_all_pods().await?;
        debug!(nodes = nodes.len(), pods = pods.len(), "Building cluster report");

        let report = self.aggregator.compute_report(&nodes, &pods).await;
        Ok(ClusterMetricsOutcome::Report(report))
    }
}

/// "Port forward started: localhost:8080 -> pod/web:80 in namespace default"
pub fn render_started(session: &SessionSummary) -> String {
    format!(
        "Port forward started: localhost:{} -> {}/{}:{} in namespace {}",
        session.local_port,
        session.resource_type,
        session.resource_name,
        session.remote_port,
        session.namespace
    )
}

/// Reply to a successful stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub local_port: u16,
    pub outcome: CloseOutcome,
    pub message: String,
}

impl StopResponse {
    pub fn new(local_port: u16, outcome: CloseOutcome) -> Self {
        Self {
            local_port,
            outcome,
            message: render_stopped(local_port, outcome),
        }
    }
}

pub fn render_stopped(local_port: u16, outcome: CloseOutcome) -> String {
    if outcome.was_running() || outcome == CloseOutcome::Cancelled {
        format!("Port forward to local port {} stopped", local_port)
    } else {
        format!("Port forward to local port {} was already stopped", local_port)
    }
}

pub fn render_pruned(pruned: &[SessionSummary]) -> String {
    match pruned.len() {
        0 => "No exited port forwards to remove".to_string(),
        n => {
            let ports: Vec<String> = pruned.iter().map(|s| s.local_port.to_string()).collect();
            format!("Removed {} exited port forward(s): {}", n, ports.join(", "))
        }
    }
}

/// Tab-separated session table
pub fn render_sessions(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "No active port forwards".to_string();
    }

    let mut lines = vec!["LOCAL PORT\tSTATUS\tCOMMAND".to_string()];
    for session in sessions {
        let status = if session.alive { "Active" } else { "Terminated" };
        lines.push(format!("{}\t{}\t{}", session.local_port, status, session.command));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsError;
    use crate::models::{
        ContainerResources, NodeAllocatable, NodeCapacity, NodeResourceFacts, PodResourceRequest,
    };
    use crate::portforward::{
        ChildProcess, ForwardCommand, ProcessError, ProcessRuntime, ProcessStatus,
        RegistryConfig, SessionState, TerminateOutcome,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    struct StaticInventory {
        nodes: Vec<NodeResourceFacts>,
        pods: Vec<PodResourceRequest>,
    }

    #[async_trait]
    impl ClusterInventory for StaticInventory {
        async fn list_nodes(&self) -> OpsResult<Vec<NodeResourceFacts>> {
            Ok(self.nodes.clone())
        }

        async fn list_all_pods(&self) -> OpsResult<Vec<PodResourceRequest>> {
            Ok(self.pods.clone())
        }
    }

    #[derive(Debug)]
    struct IdleChild;

    #[async_trait]
    impl ChildProcess for IdleChild {
        fn pid(&self) -> Option<u32> {
            Some(42)
        }

        fn poll(&self) -> ProcessStatus {
            ProcessStatus::Running
        }

        async fn terminate(
            &self,
            _grace: Duration,
            _kill_timeout: Duration,
        ) -> Result<TerminateOutcome, ProcessError> {
            Ok(TerminateOutcome::Stopped(crate::portforward::ExitInfo::unknown()))
        }

        async fn diagnostics(&self) -> String {
            String::new()
        }
    }

    struct IdleRuntime;

    #[async_trait]
    impl ProcessRuntime for IdleRuntime {
        async fn spawn(
            &self,
            _command: &ForwardCommand,
        ) -> Result<Arc<dyn ChildProcess>, ProcessError> {
            Ok(Arc::new(IdleChild))
        }
    }

    fn tools(nodes: Vec<NodeResourceFacts>, pods: Vec<PodResourceRequest>) -> OpsTools {
        OpsTools::new(
            PortForwardRegistry::new(Arc::new(IdleRuntime), RegistryConfig::default()),
            Arc::new(StaticInventory { nodes, pods }),
            ResourceAggregator::default(),
            "default",
        )
    }

    fn request(resource_type: Option<&str>, local_port: i64) -> PortForwardRequest {
        PortForwardRequest {
            resource: "web".to_string(),
            local_port,
            remote_port: 80,
            namespace: None,
            resource_type: resource_type.map(str::to_string),
        }
    }

    #[test]
    fn test_request_defaults() {
        let target = request(None, 8080).into_target("shop").unwrap();
        assert_eq!(target.kind, TargetKind::Pod);
        assert_eq!(target.namespace, "shop");

        let target = request(Some("svc"), 8080).into_target("shop").unwrap();
        assert_eq!(target.kind, TargetKind::Service);
    }

    #[test]
    fn test_request_rejects_bad_arguments() {
        assert!(matches!(
            request(None, 99999).into_target("default"),
            Err(OpsError::Validation(_))
        ));
        assert!(matches!(
            request(Some("ingress"), 8080).into_target("default"),
            Err(OpsError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_stop_list_messages() {
        let tools = tools(vec![], vec![]);

        let session = tools.open_port_forward(request(None, 8080)).await.unwrap();
        assert_eq!(
            render_started(&session),
            "Port forward started: localhost:8080 -> pod/web:80 in namespace default"
        );

        let listing = render_sessions(&tools.list_port_forwards());
        assert_eq!(
            listing,
            "LOCAL PORT\tSTATUS\tCOMMAND\n8080\tActive\tkubectl port-forward pod/web 8080:80 -n default"
        );

        let outcome = tools.stop_port_forward(8080).await.unwrap();
        let stopped = StopResponse::new(8080, outcome);
        assert_eq!(stopped.message, "Port forward to local port 8080 stopped");
        assert_eq!(render_sessions(&tools.list_port_forwards()), "No active port forwards");
        assert!(tools.prune_port_forwards().is_empty());
    }

    #[test]
    fn test_render_terminated_session() {
        let session = SessionSummary {
            id: Uuid::new_v4(),
            local_port: 9090,
            remote_port: 90,
            resource_type: TargetKind::Service,
            resource_name: "api".to_string(),
            namespace: "default".to_string(),
            started_at: Utc::now(),
            state: SessionState::Terminated,
            alive: false,
            pid: Some(7),
            exit: None,
            command: "kubectl port-forward service/api 9090:90 -n default".to_string(),
        };
        assert!(render_sessions(&[session.clone()]).ends_with("9090\tTerminated\tkubectl port-forward service/api 9090:90 -n default"));
        assert_eq!(
            render_pruned(&[session]),
            "Removed 1 exited port forward(s): 9090"
        );
        assert_eq!(render_pruned(&[]), "No exited port forwards to remove");
        assert_eq!(
            render_stopped(9090, CloseOutcome::AlreadyExited),
            "Port forward to local port 9090 was already stopped"
        );
    }

    #[tokio::test]
    async fn test_metrics_with_no_nodes() {
        let outcome = tools(vec![], vec![]).get_cluster_metrics().await.unwrap();
        assert!(matches!(outcome, ClusterMetricsOutcome::NoNodes));
        assert_eq!(outcome.to_string(), "No nodes found in the cluster");
    }

    #[tokio::test]
    async fn test_metrics_report() {
        let node = NodeResourceFacts {
            name: "worker-1".to_string(),
            capacity: NodeCapacity {
                cpu: "4".into(),
                memory: "8Gi".into(),
                pods: "110".into(),
            },
            allocatable: NodeAllocatable {
                cpu: "4".into(),
                memory: "8Gi".into(),
            },
            ..Default::default()
        };
        let pod = PodResourceRequest {
            name: "web-0".to_string(),
            namespace: "default".to_string(),
            node_name: Some("worker-1".to_string()),
            containers: vec![ContainerResources {
                name: "app".to_string(),
                requests_cpu: "1".into(),
                ..Default::default()
            }],
        };

        let outcome = tools(vec![node], vec![pod]).get_cluster_metrics().await.unwrap();
        let ClusterMetricsOutcome::Report(report) = outcome else {
            panic!("expected a report");
        };
        assert_eq!(report.cpu.requests, 1.0);
        assert_eq!(report.cpu.requests_percent, Some(25.0));
        assert_eq!(report.pods.used, 1);
    }
}
