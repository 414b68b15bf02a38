//! HTTP API for the ops tools, health checks and Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use ops_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    observability::{self, OpsMetrics, StructuredLogger},
    tools::ClusterMetricsOutcome,
    OpsError, OpsTools, PortForwardRequest, SessionSummary, StopResponse,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub tools: OpsTools,
    pub health_registry: HealthRegistry,
    pub metrics: OpsMetrics,
    pub logger: StructuredLogger,
}

impl AppState {
    pub fn new(
        tools: OpsTools,
        health_registry: HealthRegistry,
        metrics: OpsMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            tools,
            health_registry,
            metrics,
            logger,
        }
    }

    fn refresh_active_gauge(&self) {
        self.metrics
            .set_active_port_forwards(self.tools.registry().active_count());
    }
}

/// Error body: `{"error": kind, "message": text}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// An [`OpsError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(OpsError);

impl From<OpsError> for ApiError {
    fn from(err: OpsError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(OpsError::Validation(rejection.body_text()))
    }
}

pub fn status_for(err: &OpsError) -> StatusCode {
    match err {
        OpsError::Validation(_) => StatusCode::BAD_REQUEST,
        OpsError::NotFound { .. } => StatusCode::NOT_FOUND,
        OpsError::AlreadyForwarding { .. } | OpsError::Aborted { .. } => StatusCode::CONFLICT,
        OpsError::ProcessSpawnFailure { .. } => StatusCode::BAD_GATEWAY,
        OpsError::ProcessTerminateTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OpsError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    /// `json` (default) or `text`
    #[serde(default)]
    pub format: Option<String>,
}

async fn open_port_forward(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PortForwardRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let local_port = u16::try_from(request.local_port).unwrap_or_default();

    match state.tools.open_port_forward(request).await {
        Ok(session) => {
            state.metrics.inc_opened();
            state.refresh_active_gauge();
            state.logger.log_port_forward_opened(&session);
            Ok((StatusCode::CREATED, Json(session)))
        }
        Err(e) => {
            state.metrics.record_failure(&e);
            state.logger.log_port_forward_failed(local_port, &e);
            Err(e.into())
        }
    }
}

async fn list_port_forwards(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresh_active_gauge();
    Json(state.tools.list_port_forwards())
}

async fn prune_port_forwards(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let pruned = state.tools.prune_port_forwards();
    state.refresh_active_gauge();
    if !pruned.is_empty() {
        info!(count = pruned.len(), "Pruned exited port-forwards");
    }
    Json(pruned)
}

async fn stop_port_forward(
    State(state): State<Arc<AppState>>,
    Path(local_port): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let raw = local_port
        .parse::<i64>()
        .map_err(|_| OpsError::Validation(format!("local_port must be a number, got {:?}", local_port)))?;

    match state.tools.stop_port_forward(raw).await {
        Ok(outcome) => {
            let local_port = raw as u16;
            state.metrics.inc_closed();
            state.refresh_active_gauge();
            state.logger.log_port_forward_closed(local_port, outcome);
            state.health_registry.set_healthy(components::PORT_FORWARDS).await;
            Ok(Json(StopResponse::new(local_port, outcome)))
        }
        Err(e) => {
            if let OpsError::ProcessTerminateTimeout { local_port } = &e {
                state
                    .health_registry
                    .set_degraded(
                        components::PORT_FORWARDS,
                        format!("port-forward on {} did not exit", local_port),
                    )
                    .await;
            }
            state.metrics.record_failure(&e);
            state
                .logger
                .log_port_forward_failed(u16::try_from(raw).unwrap_or_default(), &e);
            Err(e.into())
        }
    }
}

async fn cluster_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Response, ApiError> {
    let started = Instant::now();

    let outcome = match state.tools.get_cluster_metrics().await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.metrics.inc_upstream_failures();
            state.logger.log_upstream_failure(&e);
            state
                .health_registry
                .set_unhealthy(components::CLUSTER_INVENTORY, e.to_string())
                .await;
            return Err(e.into());
        }
    };
    state
        .health_registry
        .set_healthy(components::CLUSTER_INVENTORY)
        .await;

    if let ClusterMetricsOutcome::Report(report) = &outcome {
        let elapsed = started.elapsed().as_secs_f64();
        state.metrics.observe_report_duration(elapsed);
        state.logger.log_report(report, elapsed);

        // Without a configured source every row is N/A anyway
        if state.tools.live_metrics_enabled() {
            record_live_metrics(&state, report.live_metrics_unavailable, report.nodes.len()).await;
        }
    }

    let response = match query.format.as_deref() {
        Some("text") => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            outcome.to_string(),
        )
            .into_response(),
        None | Some("json") => Json(outcome).into_response(),
        Some(other) => {
            return Err(OpsError::Validation(format!(
                "unsupported format {:?}, expected json or text",
                other
            ))
            .into())
        }
    };
    Ok(response)
}

async fn record_live_metrics(state: &AppState, unavailable: usize, nodes: usize) {
    if unavailable == 0 {
        state.health_registry.set_healthy(components::LIVE_METRICS).await;
        return;
    }

    state.metrics.add_live_metrics_unavailable(unavailable);
    state
        .health_registry
        .set_degraded(
            components::LIVE_METRICS,
            format!("live metrics unavailable for {} of {} nodes", unavailable, nodes),
        )
        .await;
}

/// Returns 200 while healthy or degraded, 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    match observability::gather_text() {
        Ok(buffer) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/port-forwards",
            get(list_port_forwards).post(open_port_forward),
        )
        .route("/api/v1/port-forwards/prune", post(prune_port_forwards))
        .route("/api/v1/port-forwards/:local_port", delete(stop_port_forward))
        .route("/api/v1/cluster/metrics", get(cluster_metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
