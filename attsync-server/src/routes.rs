//! HTTP control plane. Handlers are thin wrappers that delegate to
//! the service facade and shape JSON envelopes.

use attsync_core::error::SyncError;
use attsync_core::service::SyncService;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub fn router(service: Arc<SyncService>) -> Router {
    Router::new()
        .route("/api/sync/start", post(start_scheduler))
        .route("/api/sync/stop", post(stop_scheduler))
        .route("/api/sync/one", post(poll_all))
        .route("/api/sync/branch/:branch_id", post(poll_branch))
        .route("/api/sync/job/:job_id", get(job_status))
        .route("/api/sync/jobs", get(recent_jobs))
        .route("/api/admin/export/enddb", post(run_export))
        .route("/api/logs/poll/:device_id", post(poll_device))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
struct StartSchedulerRequest {
    interval_seconds: Option<u64>,
}

async fn start_scheduler(
    State(service): State<Arc<SyncService>>,
    body: Option<Json<StartSchedulerRequest>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let interval = body
        .and_then(|Json(req)| req.interval_seconds)
        .map(Duration::from_secs);
    let job_id = service.start_scheduler_job(interval);
    (StatusCode::ACCEPTED, Json(json!({ "job_id": job_id })))
}

async fn stop_scheduler(
    State(service): State<Arc<SyncService>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let job_id = service.stop_scheduler_job();
    (StatusCode::ACCEPTED, Json(json!({ "job_id": job_id })))
}

async fn poll_all(
    State(service): State<Arc<SyncService>>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    let job_id = service
        .start_poll_all_job()
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

async fn poll_branch(
    State(service): State<Arc<SyncService>>,
    Path(branch_id): Path<i64>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    let job_id = service
        .start_poll_branch_job(branch_id)
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

async fn job_status(
    State(service): State<Arc<SyncService>>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let job = Uuid::parse_str(&job_id)
        .ok()
        .and_then(|id| service.get_job(id))
        .ok_or((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found" })),
        ))?;
    Ok(Json(json!(job)))
}

async fn recent_jobs(State(service): State<Arc<SyncService>>) -> Json<serde_json::Value> {
    Json(json!({ "jobs": service.list_jobs(50) }))
}

#[derive(Debug, Default, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn run_export(
    State(service): State<Arc<SyncService>>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match service.run_export(query.dry_run).await {
        Ok(outcome) => Ok(Json(json!({ "result": outcome }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn poll_device(
    State(service): State<Arc<SyncService>>,
    Path(device_id): Path<i64>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    match service.poll_device_once(device_id).await {
        Ok(Some(fetched)) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "device": device_id, "fetched_records": fetched })),
        )),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found" })),
        )),
        Err(SyncError::Network(message)) => Err((
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": "zk_timeout", "message": message })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "message": e.to_string() })),
        )),
    }
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}
