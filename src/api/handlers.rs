use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{error::ApiResult, AppState};
use crate::{
    audit::audit_record,
    error::RenewalError,
    extraction::{extract, ExtractionResult, RawCapture},
    partner::ApiPoint,
    reconcile::{ReconciliationReport, ReconciliationService},
    renewal::{CancelOutcome, ForceOutcome},
    storage::models::{Point, RenewalQueueItem},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub processing: usize,
    pub queued: usize,
}

fn reconciliation(state: &AppState) -> Result<&ReconciliationService, RenewalError> {
    state
        .reconciliation
        .as_deref()
        .ok_or_else(|| RenewalError::Config("partner API is disabled".to_string()))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queued = state.controller.queue_status().await.len();
    Json(HealthResponse {
        status: "ok",
        processing: state.controller.processing_count().await,
        queued,
    })
}

/// POST /systems/{id}/renew
///
/// Enqueues a forced renewal. A system that already has work waiting or
/// processing answers `already_in_flight` with the existing item id.
pub async fn force_renew(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> ApiResult<(StatusCode, Json<ForceOutcome>)> {
    let outcome = state.controller.force_renew(&system_id).await?;
    let status = match outcome {
        ForceOutcome::Enqueued { .. } => StatusCode::ACCEPTED,
        ForceOutcome::AlreadyInFlight { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// GET /queue
pub async fn list_queue(State(state): State<AppState>) -> Json<Vec<RenewalQueueItem>> {
    Json(state.controller.queue_status().await)
}

/// DELETE /queue/{system_id}
pub async fn cancel(State(state): State<AppState>, Path(system_id): Path<String>) -> ApiResult<Json<CancelOutcome>> {
    Ok(Json(state.controller.cancel(&system_id).await?))
}

/// GET /reconciliation
pub async fn reconciliation_report(State(state): State<AppState>) -> ApiResult<Json<ReconciliationReport>> {
    Ok(Json(reconciliation(&state)?.report().await?))
}

/// POST /reconciliation/points/{username}/push
pub async fn push_point(State(state): State<AppState>, Path(username): Path<String>) -> ApiResult<Json<ApiPoint>> {
    info!("Operator push requested for point {}", username);
    Ok(Json(reconciliation(&state)?.push_point(&username).await?))
}

/// POST /reconciliation/points/{username}/pull
pub async fn pull_point(State(state): State<AppState>, Path(username): Path<String>) -> ApiResult<Json<Point>> {
    info!("Operator pull requested for point {}", username);
    Ok(Json(reconciliation(&state)?.pull_point(&username).await?))
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    /// System the capture belongs to, used only for the audit trail.
    pub system_id: Option<String>,
    pub text: String,
}

/// POST /captures
///
/// Runs the extraction chain over text posted by an external capture
/// front-end. 422 when nothing usable is found.
pub async fn submit_capture(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> ApiResult<Json<ExtractionResult>> {
    let capture = RawCapture::new(request.text);
    let result = extract(&capture).map_err(RenewalError::from)?;

    let system_id = request.system_id.as_deref().unwrap_or("capture");
    if let Err(e) = state.audit.record(&audit_record(system_id, &result)).await {
        warn!("Failed to audit capture {}: {}", result.raw_digest, e);
    }

    Ok(Json(result))
}
