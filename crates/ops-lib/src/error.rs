//! Error types for port-forward and cluster report operations

use thiserror::Error;

/// Errors returned by the tool-facing operations
#[derive(Debug, Error)]
pub enum OpsError {
    /// Malformed port, resource type or resource name
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// A live tunnel already owns the local port
    #[error("Port {local_port} is already forwarded. Stop it first with stop_port_forward.")]
    AlreadyForwarding { local_port: u16 },

    /// No session is registered for the local port
    #[error("No port forward found for local port {local_port}")]
    NotFound { local_port: u16 },

    /// The forwarding process could not be started or died during its grace window
    #[error("Port forward failed: {stderr}")]
    ProcessSpawnFailure { local_port: u16, stderr: String },

    /// The forwarding process survived both the graceful stop and the forced kill
    #[error("Port forward on local port {local_port} did not exit after being killed")]
    ProcessTerminateTimeout { local_port: u16 },

    /// The session was stopped while its open was still in the grace window
    #[error("Port forward on local port {local_port} was stopped before it became active")]
    Aborted { local_port: u16 },

    /// The cluster API could not be reached
    #[error("Error getting cluster metrics: {0}")]
    UpstreamUnavailable(String),
}

impl OpsError {
    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            OpsError::Validation(_) => "validation_error",
            OpsError::AlreadyForwarding { .. } => "already_forwarding",
            OpsError::NotFound { .. } => "not_found",
            OpsError::ProcessSpawnFailure { .. } => "process_spawn_failure",
            OpsError::ProcessTerminateTimeout { .. } => "process_terminate_timeout",
            OpsError::Aborted { .. } => "aborted",
            OpsError::UpstreamUnavailable(_) => "upstream_unavailable",
        }
    }
}

impl From<kube::Error> for OpsError {
    fn from(err: kube::Error) -> Self {
        OpsError::UpstreamUnavailable(err.to_string())
    }
}

/// Live metrics for a node could not be obtained
///
/// This never fails a whole report; the affected node row is shown as `N/A`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Metrics unavailable for node {node}: {reason}")]
pub struct MetricsUnavailable {
    pub node: String,
    pub reason: String,
}

impl MetricsUnavailable {
    pub fn new(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for tool-facing operations
pub type OpsResult<T> = std::result::Result<T, OpsError>;
