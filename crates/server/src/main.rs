//! clusterops server
//!
//! Owns the port-forward registry for the lifetime of the process and serves
//! the tool API alongside health and metrics endpoints.

use anyhow::Result;
use clusterops_server::{
    api,
    config::{LiveMetricsMode, ServerConfig},
};
use ops_lib::{
    health::{components, HealthRegistry},
    observability::{OpsMetrics, StructuredLogger},
    ClusterInventory, KubeInventory, KubectlTopSource, LiveMetricsSource, MetricsApiSource,
    OpsTools, PortForwardRegistry, ResourceAggregator, TokioProcessRuntime, UnavailableInventory,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = ServerConfig::load()?;
    info!(
        port = config.api_port,
        namespace = %config.default_namespace,
        live_metrics = ?config.live_metrics,
        "Server configured"
    );

    let health_registry = HealthRegistry::with_default_components().await;
    let metrics = OpsMetrics::new();
    let logger = StructuredLogger::new(hostname());

    // The server still starts without a cluster; reports then fail upstream
    let kube = match KubeInventory::try_default().await {
        Ok(inventory) => Some(inventory),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Cluster API not configured, metrics reports disabled");
            health_registry
                .set_degraded(components::CLUSTER_INVENTORY, format!("{:#}", e))
                .await;
            None
        }
    };

    let live_metrics: Option<Arc<dyn LiveMetricsSource>> = match (config.live_metrics, &kube) {
        (LiveMetricsMode::Kubectl, _) => {
            Some(Arc::new(KubectlTopSource::new(config.kubectl_path.clone())))
        }
        (LiveMetricsMode::MetricsApi, Some(inventory)) => {
            Some(Arc::new(MetricsApiSource::new(inventory.client().clone())))
        }
        (LiveMetricsMode::MetricsApi, None) | (LiveMetricsMode::Disabled, _) => None,
    };

    let inventory: Arc<dyn ClusterInventory> = match kube {
        Some(inventory) => Arc::new(inventory),
        None => Arc::new(UnavailableInventory::new(
            "no Kubernetes configuration available",
        )),
    };

    let registry = PortForwardRegistry::new(
        Arc::new(TokioProcessRuntime::new()),
        config.registry_config(),
    );
    let tools = OpsTools::new(
        registry.clone(),
        inventory,
        ResourceAggregator::new(live_metrics, config.report_config()),
        config.default_namespace.clone(),
    );

    let app_state = Arc::new(api::AppState::new(
        tools,
        health_registry.clone(),
        metrics,
        logger.clone(),
    ));

    health_registry.set_ready(true).await;
    logger.log_startup(SERVER_VERSION, config.api_port);

    api::serve(config.api_port, app_state, shutdown_signal()).await?;

    health_registry.set_ready(false).await;
    let stopped = registry.shutdown().await;
    logger.log_shutdown("SIGINT received", stopped);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "clusterops".to_string())
}
