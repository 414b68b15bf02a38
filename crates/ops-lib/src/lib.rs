//! Cluster operations library
//!
//! This crate provides:
//! - Resource quantity parsing and formatting
//! - Cluster resource reports from node and pod inventories
//! - A port-forward session registry over `kubectl port-forward`
//! - Health checks and observability for the ops server

pub mod error;
pub mod health;
pub mod inventory;
pub mod live_metrics;
pub mod models;
pub mod observability;
pub mod portforward;
pub mod quantity;
pub mod report;
pub mod tools;

pub use error::{MetricsUnavailable, OpsError, OpsResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use inventory::{ClusterInventory, KubeInventory, UnavailableInventory};
pub use live_metrics::{KubectlTopSource, LiveMetricsSource, MetricsApiSource};
pub use models::*;
pub use observability::{OpsMetrics, StructuredLogger};
pub use portforward::{
    CloseOutcome, ForwardTarget, PortForwardRegistry, RegistryConfig, SessionState,
    SessionSummary, TargetKind, TokioProcessRuntime,
};
pub use report::{ClusterResourceReport, ReportConfig, ResourceAggregator};
pub use tools::{ClusterMetricsOutcome, OpsTools, PortForwardRequest, StopResponse};
