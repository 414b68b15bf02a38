//! Cluster inventory: node and pod resource snapshots from the Kubernetes API

use crate::error::{OpsError, OpsResult};
use crate::models::{
    ContainerResources, NodeAllocatable, NodeCapacity, NodeReadiness, NodeResourceFacts,
    PodResourceRequest, QuantityValue,
};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Source of node and pod resource facts
///
/// Failures are returned as [`crate::OpsError::UpstreamUnavailable`] and
/// abort the report that asked for them.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// List every node with its capacity and allocatable resources
    async fn list_nodes(&self) -> OpsResult<Vec<NodeResourceFacts>>;

    /// List every pod in every namespace with its container resources
    async fn list_all_pods(&self) -> OpsResult<Vec<PodResourceRequest>>;
}

/// Inventory backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeInventory {
    client: Client,
}

impl KubeInventory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the local kubeconfig or the in-cluster service account
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to load Kubernetes configuration")?;
        Ok(Self::new(client))
    }

    /// Underlying client, shared with the metrics-server source
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterInventory for KubeInventory {
    async fn list_nodes(&self) -> OpsResult<Vec<NodeResourceFacts>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed nodes");
        Ok(list.items.iter().map(node_facts).collect())
    }

    async fn list_all_pods(&self) -> OpsResult<Vec<PodResourceRequest>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed pods");
        Ok(list.items.iter().map(pod_request).collect())
    }
}

/// Inventory used when no cluster connection could be configured
///
/// Every call fails with [`crate::OpsError::UpstreamUnavailable`] carrying
/// the reason the connection was not set up.
#[derive(Debug, Clone)]
pub struct UnavailableInventory {
    reason: String,
}

impl UnavailableInventory {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ClusterInventory for UnavailableInventory {
    async fn list_nodes(&self) -> OpsResult<Vec<NodeResourceFacts>> {
        Err(OpsError::UpstreamUnavailable(self.reason.clone()))
    }

    async fn list_all_pods(&self) -> OpsResult<Vec<PodResourceRequest>> {
        Err(OpsError::UpstreamUnavailable(self.reason.clone()))
    }
}

fn quantity(map: Option<&BTreeMap<String, Quantity>>, key: &str) -> QuantityValue {
    map.and_then(|m| m.get(key))
        .map(|q| QuantityValue::Text(q.0.clone()))
        .unwrap_or_default()
}

/// Convert a Kubernetes node into resource facts
pub fn node_facts(node: &Node) -> NodeResourceFacts {
    let status = node.status.as_ref();
    let capacity = status.and_then(|s| s.capacity.as_ref());
    let allocatable = status.and_then(|s| s.allocatable.as_ref());

    let readiness = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| {
            if c.status == "True" {
                NodeReadiness::Ready
            } else {
                NodeReadiness::NotReady
            }
        })
        .unwrap_or_default();

    NodeResourceFacts {
        name: node.metadata.name.clone().unwrap_or_default(),
        readiness,
        capacity: NodeCapacity {
            cpu: quantity(capacity, "cpu"),
            memory: quantity(capacity, "memory"),
            pods: quantity(capacity, "pods"),
        },
        allocatable: NodeAllocatable {
            cpu: quantity(allocatable, "cpu"),
            memory: quantity(allocatable, "memory"),
        },
    }
}

fn container_resources(container: &Container) -> ContainerResources {
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    ContainerResources {
        name: container.name.clone(),
        requests_cpu: quantity(requests, "cpu"),
        requests_memory: quantity(requests, "memory"),
        limits_cpu: quantity(limits, "cpu"),
        limits_memory: quantity(limits, "memory"),
    }
}

/// Convert a Kubernetes pod into its declared container resources
pub fn pod_request(pod: &Pod) -> PodResourceRequest {
    let spec = pod.spec.as_ref();

    PodResourceRequest {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        node_name: spec.and_then(|s| s.node_name.clone()),
        containers: spec
            .map(|s| s.containers.iter().map(container_resources).collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn test_node_facts_from_status() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(quantities(&[("cpu", "4"), ("memory", "16Gi"), ("pods", "110")])),
                allocatable: Some(quantities(&[("cpu", "3800m"), ("memory", "15Gi")])),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let facts = node_facts(&node);
        assert_eq!(facts.name, "worker-1");
        assert_eq!(facts.readiness, NodeReadiness::Ready);
        assert_eq!(facts.capacity.pods, QuantityValue::from("110"));
        assert_eq!(facts.allocatable.cpu, QuantityValue::from("3800m"));
    }

    #[test]
    fn test_node_facts_missing_status_defaults() {
        let node = Node::default();
        let facts = node_facts(&node);
        assert_eq!(facts.readiness, NodeReadiness::Unknown);
        assert_eq!(facts.capacity.cpu, QuantityValue::from("0"));
        assert_eq!(facts.allocatable.memory, QuantityValue::from("0"));
    }

    #[test]
    fn test_pod_request_from_spec() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".to_string()),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities(&[("cpu", "250m"), ("memory", "64Mi")])),
                            limits: Some(quantities(&[("cpu", "1")])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        let request = pod_request(&pod);
        assert_eq!(request.namespace, "shop");
        assert_eq!(request.node_name.as_deref(), Some("worker-1"));
        assert_eq!(request.containers.len(), 2);
        assert_eq!(request.containers[0].requests_cpu, QuantityValue::from("250m"));
        assert_eq!(request.containers[0].limits_memory, QuantityValue::from("0"));
        assert_eq!(request.containers[1].requests_memory, QuantityValue::from("0"));
    }

    #[tokio::test]
    async fn test_unavailable_inventory_reports_reason() {
        let inventory = UnavailableInventory::new("no kubeconfig found");
        let err = inventory.list_nodes().await.unwrap_err();
        assert!(matches!(err, OpsError::UpstreamUnavailable(ref r) if r == "no kubeconfig found"));
    }
}
