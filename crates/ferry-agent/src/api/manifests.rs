//! Manifest command handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::models::RemovalSummary;
use crate::upload::UploadAck;

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub cancel_all: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelResponse {
    pub status: String,
    pub cancelled_count: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetResponse {
    pub updated: u64,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub path_prefix: String,
}

async fn require_manifest(state: &AppState, manifest_id: i64) -> AppResult<()> {
    state
        .ledger
        .get_manifest(manifest_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("Manifest {} not found", manifest_id)))
}

/// Fire-and-forget: progress and failures arrive on the event feed
pub async fn upload(State(state): State<AppState>, Path(manifest_id): Path<i64>) -> Json<UploadAck> {
    tracing::info!(manifest_id, "Upload requested");
    Json(state.orchestrator.upload_manifest(manifest_id))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(manifest_id): Path<i64>,
    body: Option<Json<CancelRequest>>,
) -> Json<CancelResponse> {
    let Json(request) = body.unwrap_or_default();
    let cancelled_count = state
        .orchestrator
        .registry()
        .cancel(manifest_id, request.cancel_all);

    tracing::info!(manifest_id, cancel_all = request.cancel_all, cancelled_count, "Cancel requested");
    Json(CancelResponse {
        status: "cancelled".to_string(),
        cancelled_count,
    })
}

pub async fn reset(
    State(state): State<AppState>,
    Path(manifest_id): Path<i64>,
) -> AppResult<Json<ResetResponse>> {
    require_manifest(&state, manifest_id).await?;
    let updated = state.ledger.reset_status_for_manifest(manifest_id).await?;
    Ok(Json(ResetResponse { updated }))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(manifest_id): Path<i64>,
    Json(request): Json<RemoveRequest>,
) -> AppResult<Json<RemovalSummary>> {
    if request.path_prefix.is_empty() {
        return Err(AppError::BadRequest("path_prefix cannot be empty".to_string()));
    }
    require_manifest(&state, manifest_id).await?;

    let summary = state
        .ledger
        .remove_from_manifest(manifest_id, &request.path_prefix)
        .await?;
    Ok(Json(summary))
}
