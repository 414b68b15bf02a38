//! Live node usage from `kubectl top` or the metrics-server API

use crate::error::MetricsUnavailable;
use crate::models::NodeUsage;
use async_trait::async_trait;
use kube::api::GetParams;
use kube::core::Request;
use kube::Client;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Source of live CPU/memory usage for a node
#[async_trait]
pub trait LiveMetricsSource: Send + Sync {
    async fn node_utilization(&self, node_name: &str) -> Result<NodeUsage, MetricsUnavailable>;
}

/// Reads usage with `kubectl top node <name>`
#[derive(Debug, Clone)]
pub struct KubectlTopSource {
    kubectl: String,
}

impl KubectlTopSource {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }
}

/// Parse `kubectl top node` output
///
/// The second line holds the values; its third and fourth columns are
/// reported as CPU and memory used.
pub fn parse_top_output(stdout: &str) -> Option<NodeUsage> {
    let line = stdout.trim().lines().nth(1)?;
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 4 {
        return None;
    }

    Some(NodeUsage {
        cpu: columns[2].to_string(),
        memory: columns[3].to_string(),
    })
}

#[async_trait]
impl LiveMetricsSource for KubectlTopSource {
    async fn node_utilization(&self, node_name: &str) -> Result<NodeUsage, MetricsUnavailable> {
        debug!(node = %node_name, "Running kubectl top");
        let output = Command::new(&self.kubectl)
            .args(["top", "node", node_name])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MetricsUnavailable::new(node_name, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() && stdout.trim().is_empty() {
            return Err(MetricsUnavailable::new(node_name, stderr.trim()));
        }

        parse_top_output(&stdout)
            .ok_or_else(|| MetricsUnavailable::new(node_name, "unexpected kubectl top output"))
    }
}

/// Reads usage from the `metrics.k8s.io` API served by metrics-server
#[derive(Clone)]
pub struct MetricsApiSource {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsResponse {
    usage: UsageBlock,
}

#[derive(Debug, Deserialize)]
struct UsageBlock {
    cpu: String,
    memory: String,
}

impl MetricsApiSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LiveMetricsSource for MetricsApiSource {
    async fn node_utilization(&self, node_name: &str) -> Result<NodeUsage, MetricsUnavailable> {
        let request = Request::new("/apis/metrics.k8s.io/v1beta1/nodes")
            .get(node_name, &GetParams::default())
            .map_err(|e| MetricsUnavailable::new(node_name, e.to_string()))?;

        let response: NodeMetricsResponse = self
            .client
            .request(request)
            .await
            .map_err(|e| MetricsUnavailable::new(node_name, e.to_string()))?;

        Ok(NodeUsage {
            cpu: response.usage.cpu,
            memory: response.usage.memory,
        })
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn stand_in_kubectl(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_stderr_without_stdout_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = KubectlTopSource::new(stand_in_kubectl(
            &dir,
            "echo \"error: Metrics API not available\" >&2\nexit 1",
        ));

        let err = source.node_utilization("n1").await.unwrap_err();
        assert_eq!(
            err,
            MetricsUnavailable::new("n1", "error: Metrics API not available")
        );
    }

    #[tokio::test]
    async fn test_top_output_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let source = KubectlTopSource::new(stand_in_kubectl(
            &dir,
            "[ \"$1 $2 $3\" = \"top node worker-1\" ] || exit 2\n\
             echo \"NAME       CPU(cores)   CPU%   MEMORY(bytes)   MEMORY%\"\n\
             echo \"worker-1   250m         12%    2048Mi          26%\"",
        ));

        let usage = source.node_utilization("worker-1").await.unwrap();
        assert_eq!(usage.cpu, "12%");
        assert_eq!(usage.memory, "2048Mi");
    }
}
