//! Server configuration

use anyhow::{Context, Result};
use ops_lib::{RegistryConfig, ReportConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const ENV_PREFIX: &str = "CLUSTEROPS";

/// Where live node usage comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveMetricsMode {
    /// `kubectl top node`
    #[default]
    Kubectl,
    /// The metrics.k8s.io API
    MetricsApi,
    /// Every node row shows `N/A`
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port for the tool API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Namespace used when an open request names none
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    #[serde(default = "default_kubectl_path")]
    pub kubectl_path: String,

    /// Startup grace period for new port-forwards
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,

    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    #[serde(default)]
    pub live_metrics: LiveMetricsMode,

    /// Per-node bound on live usage lookups
    #[serde(default = "default_live_metrics_timeout_ms")]
    pub live_metrics_timeout_ms: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_kubectl_path() -> String {
    "kubectl".to_string()
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_terminate_timeout_ms() -> u64 {
    1000
}

fn default_kill_timeout_ms() -> u64 {
    2000
}

fn default_live_metrics_timeout_ms() -> u64 {
    5000
}

impl ServerConfig {
    /// Load configuration from `CLUSTEROPS_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_env(None)
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_env(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid CLUSTEROPS_* configuration")
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            kubectl: self.kubectl_path.clone(),
            grace_period: Duration::from_millis(self.grace_period_ms),
            terminate_timeout: Duration::from_millis(self.terminate_timeout_ms),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
        }
    }

    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            live_metrics_timeout: Duration::from_millis(self.live_metrics_timeout_ms),
        }
    }
}
