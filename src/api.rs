//! Admin REST endpoints for the pipeline.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::PipelineConfigUpdate;
use crate::error::PipelineError;
use crate::service::PipelineService;

/// Default and maximum `limit` of a reprocess request.
const DEFAULT_REPROCESS_LIMIT: usize = 10;
const MAX_REPROCESS_LIMIT: usize = 100;

/// Build the admin router.
pub fn admin_routes(service: Arc<PipelineService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/pipeline/stats", get(stats))
        .route("/api/pipeline/config", get(get_config).put(put_config))
        .route("/api/pipeline/start", post(start))
        .route("/api/pipeline/stop", post(stop))
        .route("/api/pipeline/clear-queue", post(clear_queue))
        .route("/api/pipeline/reprocess-failed", post(reprocess_failed))
        .route("/api/messages/{id}/steps", get(message_steps))
        .route("/api/channels/blacklist", get(list_blacklist))
        .route("/api/channels/blacklist/{id}", delete(clear_blacklist))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "Admin request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "signal-watch",
        "pipeline_running": service.is_running().await,
    }))
}

// ── Pipeline ────────────────────────────────────────────────────────

async fn stats(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    Json(service.stats().await)
}

async fn get_config(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    Json(service.config())
}

async fn put_config(
    State(service): State<Arc<PipelineService>>,
    Json(update): Json<PipelineConfigUpdate>,
) -> Response {
    match service.update_config(&update).await {
        Ok(config) => Json(config).into_response(),
        Err(PipelineError::InvalidConfig(message)) => {
            error_response(StatusCode::BAD_REQUEST, message)
        }
        Err(e) => internal(e),
    }
}

async fn start(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    service.start().await;
    info!("Pipeline started via admin API");
    Json(json!({ "running": true }))
}

async fn stop(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    service.stop().await;
    info!("Pipeline stopped via admin API");
    Json(json!({ "running": false }))
}

async fn clear_queue(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    let cleared = service.clear_queue();
    Json(json!({ "cleared": cleared }))
}

#[derive(Debug, Deserialize)]
struct ReprocessParams {
    limit: Option<usize>,
}

async fn reprocess_failed(
    State(service): State<Arc<PipelineService>>,
    Query(params): Query<ReprocessParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_REPROCESS_LIMIT);
    if !(1..=MAX_REPROCESS_LIMIT).contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_REPROCESS_LIMIT}"),
        );
    }
    match service.reprocess_failed(limit).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal(e),
    }
}

// ── Messages ────────────────────────────────────────────────────────

async fn message_steps(
    State(service): State<Arc<PipelineService>>,
    Path(id): Path<String>,
) -> Response {
    match service.message_trace(&id).await {
        Ok(Some(trace)) => Json(trace).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("message {id} not found")),
        Err(e) => internal(e),
    }
}

// ── Channels ────────────────────────────────────────────────────────

async fn list_blacklist(State(service): State<Arc<PipelineService>>) -> impl IntoResponse {
    let channels = service.blacklisted_channels();
    Json(json!({ "count": channels.len(), "channels": channels }))
}

async fn clear_blacklist(
    State(service): State<Arc<PipelineService>>,
    Path(id): Path<String>,
) -> Response {
    match service.clear_blacklist(&id).await {
        Ok(true) => {
            info!(channel_id = %id, "Channel removed from blacklist via admin API");
            Json(json!({ "cleared": id })).into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, format!("channel {id} has no access record")),
        Err(e) => internal(e),
    }
}
