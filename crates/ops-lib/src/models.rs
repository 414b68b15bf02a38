//! Core data models shared by the inventory, the aggregator and the tool layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// A raw resource quantity as reported by the cluster API
///
/// Quantities normally arrive as suffix-encoded text ("500m", "2Gi"), but
/// some sources hand back plain numbers which are taken as already being in
/// canonical units (cores or bytes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuantityValue {
    Number(f64),
    Text(String),
}

impl Default for QuantityValue {
    fn default() -> Self {
        QuantityValue::Text("0".to_string())
    }
}

impl From<&str> for QuantityValue {
    fn from(s: &str) -> Self {
        QuantityValue::Text(s.to_string())
    }
}

impl From<String> for QuantityValue {
    fn from(s: String) -> Self {
        QuantityValue::Text(s)
    }
}

impl From<f64> for QuantityValue {
    fn from(n: f64) -> Self {
        QuantityValue::Number(n)
    }
}

impl fmt::Display for QuantityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantityValue::Number(n) => write!(f, "{}", n),
            QuantityValue::Text(s) => f.write_str(s),
        }
    }
}

/// Readiness of a node, taken from its `Ready` condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeReadiness {
    Ready,
    NotReady,
    #[default]
    Unknown,
}

impl fmt::Display for NodeReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeReadiness::Ready => "Ready",
            NodeReadiness::NotReady => "NotReady",
            NodeReadiness::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Total node resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    #[serde(default)]
    pub cpu: QuantityValue,
    #[serde(default)]
    pub memory: QuantityValue,
    /// Maximum number of pods the node accepts
    #[serde(default)]
    pub pods: QuantityValue,
}

/// Node resources left for workloads after system reservations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAllocatable {
    #[serde(default)]
    pub cpu: QuantityValue,
    #[serde(default)]
    pub memory: QuantityValue,
}

/// Snapshot of one node's capacity and allocatable resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceFacts {
    pub name: String,
    #[serde(default)]
    pub readiness: NodeReadiness,
    #[serde(default)]
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub allocatable: NodeAllocatable,
}

/// Requests and limits declared by a single container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    pub name: String,
    #[serde(default)]
    pub requests_cpu: QuantityValue,
    #[serde(default)]
    pub requests_memory: QuantityValue,
    #[serde(default)]
    pub limits_cpu: QuantityValue,
    #[serde(default)]
    pub limits_memory: QuantityValue,
}

/// Snapshot of one pod's declared container resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodResourceRequest {
    pub name: String,
    pub namespace: String,
    /// Node the pod is scheduled on, if any
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerResources>,
}

/// Live usage figures for one node as reported by a metrics source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUsage {
    pub cpu: String,
    pub memory: String,
}
