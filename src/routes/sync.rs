// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sync API routes for both principals.
//!
//! The web principal requests syncs, imports provider data, and reads
//! records; the mobile principal polls the pending flag and uploads
//! batches. Auth layers are applied per route group in routes/mod.rs.

use crate::error::Result;
use crate::models::{HealthRecord, RawSample, RecordKind};
use crate::services::identity::Principal;
use crate::AppState;
use axum::{
    extract::State,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum records returned by GET /records.
const RECORDS_PAGE_LIMIT: u32 = 50;

/// Routes for the web principal (session auth applied in routes/mod.rs).
pub fn web_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/request", post(request_sync))
        .route("/sync/import", post(import_from_provider))
        .route("/records", get(get_records))
}

/// Routes for the mobile principal (delegated-token auth applied in
/// routes/mod.rs).
pub fn mobile_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/check", get(check_sync))
        .route("/sync/upload", post(upload_samples))
}

// ─── Responses ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct PendingResponse {
    pub pending: bool,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub status: String,
    pub count: usize,
}

#[derive(Deserialize)]
pub struct UploadRequest {
    pub data: Vec<RawSample>,
}

/// A stored record as returned to the web client.
#[derive(Serialize)]
pub struct RecordResponse {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub systolic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diastolic: Option<f64>,
}

impl From<HealthRecord> for RecordResponse {
    fn from(record: HealthRecord) -> Self {
        Self {
            kind: record.kind,
            date: record.recorded_at,
            count: record.count,
            bpm: record.bpm,
            value: record.value,
            duration: record.duration,
            systolic: record.systolic,
            diastolic: record.diastolic,
        }
    }
}

#[derive(Serialize)]
pub struct RecordsResponse {
    pub records: Vec<RecordResponse>,
}

// ─── Handlers ────────────────────────────────────────────────

/// Register a sync request (web principal).
async fn request_sync(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<StatusResponse>> {
    state.sync.request_sync(&principal.user_id).await?;

    Ok(Json(StatusResponse {
        status: "success".to_string(),
    }))
}

/// Check the pending flag (mobile principal).
async fn check_sync(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<PendingResponse>> {
    let pending = state.sync.check_pending(&principal.user_id).await?;

    Ok(Json(PendingResponse { pending }))
}

/// Upload a sample batch (mobile principal). Fulfills the pending flag.
async fn upload_samples(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>> {
    let count = state
        .sync
        .ingest(&principal.user_id, &request.data, None)
        .await?;

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        count,
    }))
}

/// Pull today's data from Fitbit and ingest it with a raw snapshot
/// (web principal).
async fn import_from_provider(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<UploadResponse>> {
    let (samples, raw) = state.fitbit.fetch_today_samples(&principal.user_id).await?;

    let count = state
        .sync
        .ingest(&principal.user_id, &samples, Some(raw))
        .await?;

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        count,
    }))
}

/// Most recent records, newest first (web principal).
async fn get_records(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<RecordsResponse>> {
    let records = state
        .sync
        .recent_records(&principal.user_id, RECORDS_PAGE_LIMIT)
        .await?;

    Ok(Json(RecordsResponse {
        records: records.into_iter().map(RecordResponse::from).collect(),
    }))
}
