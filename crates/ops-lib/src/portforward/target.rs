//! What a port-forward points at

use crate::error::{OpsError, OpsResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of resource `kubectl port-forward` can target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Pod,
    Service,
    Deployment,
    StatefulSet,
    ReplicaSet,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Pod => "pod",
            TargetKind::Service => "service",
            TargetKind::Deployment => "deployment",
            TargetKind::StatefulSet => "statefulset",
            TargetKind::ReplicaSet => "replicaset",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Ok(TargetKind::Pod),
            "service" | "services" | "svc" => Ok(TargetKind::Service),
            "deployment" | "deployments" | "deploy" => Ok(TargetKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(TargetKind::StatefulSet),
            "replicaset" | "replicasets" | "rs" => Ok(TargetKind::ReplicaSet),
            other => Err(OpsError::Validation(format!(
                "unsupported resource type {:?}, expected one of pod, service, deployment, statefulset, replicaset",
                other
            ))),
        }
    }
}

/// A validated forwarding target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub kind: TargetKind,
    pub name: String,
    pub namespace: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardTarget {
    /// Build a target, checking names and ports
    pub fn new(
        kind: TargetKind,
        name: impl Into<String>,
        namespace: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> OpsResult<Self> {
        let target = Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
            local_port,
            remote_port,
        };
        target.validate()?;
        Ok(target)
    }

    /// `<kind>/<name>` as kubectl expects it
    pub fn resource(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    fn validate(&self) -> OpsResult<()> {
        check_port("local_port", self.local_port as i64)?;
        check_port("remote_port", self.remote_port as i64)?;
        check_name("resource name", &self.name, 253)?;
        check_name("namespace", &self.namespace, 63)?;
        Ok(())
    }
}

/// Convert a raw port argument, rejecting anything outside 1..=65535
pub fn check_port(field: &str, value: i64) -> OpsResult<u16> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(OpsError::Validation(format!(
            "{} must be between 1 and 65535, got {}",
            field, value
        ))),
    }
}

// Lowercase DNS-style names: alphanumerics, '-' and '.'
fn check_name(field: &str, value: &str, max_len: usize) -> OpsResult<()> {
    if value.is_empty() {
        return Err(OpsError::Validation(format!("{} must not be empty", field)));
    }
    if value.len() > max_len {
        return Err(OpsError::Validation(format!(
            "{} is longer than {} characters",
            field, max_len
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !valid || value.starts_with('-') || value.ends_with('-') {
        return Err(OpsError::Validation(format!(
            "{} {:?} is not a valid Kubernetes name",
            field, value
        )));
    }
    Ok(())
}
