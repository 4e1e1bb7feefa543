//! Inbound HTTP surface: health probes, operator status, job cancellation and
//! Prometheus metrics.

use axum::{
    extract::{ConnectInfo, Extension, Path},
    http::StatusCode,
    response::{Html, IntoResponse, Json as AxumJson, Response},
    routing::{get, post},
    Router,
};
use hypernode_types::{CancelAck, HealthProbe, HealthVerdict, JobId};
use prometheus::{gather, Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::health::HealthCheckResponder;
use crate::reputation::ReputationEngine;
use crate::scheduler::JobScheduler;
use crate::state::NodeHandle;

/// Everything the handlers need, shared through one extension layer.
#[derive(Clone)]
pub struct ServerState {
    pub node: NodeHandle,
    pub scheduler: JobScheduler,
    pub reputation: Arc<ReputationEngine>,
    pub health: Arc<HealthCheckResponder>,
}

#[derive(Debug, Deserialize)]
pub struct HealthCheckRequest {
    /// Self-declared; logged and recorded, but rate limiting keys on the peer address.
    pub requester: String,
    #[serde(flatten)]
    pub probe: HealthProbe,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health/check", post(health_check_handler))
        .route("/healthz", get(liveness_handler))
        .route("/status", get(status_handler))
        .route("/reputation", get(reputation_handler))
        .route("/jobs/:job_id/cancel", post(cancel_job_handler))
        .route("/metrics", get(metrics_handler))
        .layer(Extension(state))
}

async fn health_check_handler(
    Extension(state): Extension<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    AxumJson(mut req): AxumJson<HealthCheckRequest>,
) -> Response {
    if req.requester.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            AxumJson(json!({ "error": "requester must not be empty" })),
        )
            .into_response();
    }
    if req.probe.nonce.is_empty() {
        req.probe.nonce = Uuid::new_v4().to_string();
    }
    let answer = state
        .health
        .handle_check(peer.ip(), &req.requester, &req.probe)
        .await;
    let status = match answer.verdict {
        HealthVerdict::Throttled => StatusCode::TOO_MANY_REQUESTS,
        HealthVerdict::Pass | HealthVerdict::Fail => StatusCode::OK,
    };
    (status, AxumJson(answer)).into_response()
}

async fn liveness_handler(Extension(state): Extension<ServerState>) -> Response {
    let lifecycle = state.node.lifecycle();
    let code = if lifecycle.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, AxumJson(json!({ "lifecycle": lifecycle.as_str() }))).into_response()
}

async fn status_handler(Extension(state): Extension<ServerState>) -> impl IntoResponse {
    let status = state.node.snapshot();
    let reputation = state.reputation.current_snapshot();
    AxumJson(json!({
        "status": status,
        "reputation": reputation.as_ref(),
    }))
}

async fn reputation_handler(Extension(state): Extension<ServerState>) -> impl IntoResponse {
    AxumJson((*state.reputation.current_snapshot()).clone())
}

async fn cancel_job_handler(
    Extension(state): Extension<ServerState>,
    Path(job_id): Path<String>,
) -> StatusCode {
    match state.scheduler.cancel(&JobId::new(job_id)) {
        CancelAck::Ack => StatusCode::ACCEPTED,
        CancelAck::NotFound => StatusCode::NOT_FOUND,
    }
}

async fn metrics_handler() -> Html<String> {
    let encoder = TextEncoder::new();
    let metric_families = gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        return Html(format!("# ERROR: Failed to encode metrics: {}\n", e));
    }
    match String::from_utf8(buffer) {
        Ok(text) => Html(text),
        Err(e) => {
            tracing::error!("Failed to convert Prometheus buffer to UTF-8: {}", e);
            Html("# ERROR: Failed to convert buffer to UTF-8\n".to_string())
        }
    }
}

/// Serve until `shutdown` fires. Connections carry their peer address, which the
/// health-check handler needs.
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Node API listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
