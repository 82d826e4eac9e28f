//! Batch resolution endpoints
//!
//! `POST /resolve` accepts a list of location records and starts a concurrent
//! resolution batch; it returns the batch id immediately without waiting for
//! any provider. Progress arrives on `GET /events` (SSE) and the authoritative
//! state is available at `GET /resolve/:batch_id`. `POST /image/regenerate`
//! re-runs the cascade for one record synchronously.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::BatchSnapshot;
use crate::AppState;
use bookvibe_common::records::LocationRecord;

/// POST /resolve request body
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub records: Vec<LocationRecord>,
}

/// POST /resolve response body
#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub batch_id: Uuid,
    pub total: usize,
}

/// POST /resolve - start resolving a batch of location records
pub async fn start_resolve(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<(StatusCode, Json<ResolveResponse>)> {
    if request.records.is_empty() {
        return Err(ApiError::BadRequest(
            "records must not be empty".to_string(),
        ));
    }

    let total = request.records.len();
    let batch = state.orchestrator.resolve_batch(request.records);
    let batch_id = batch.id();
    state.batches.write().await.insert(batch_id, batch);

    tracing::info!(batch_id = %batch_id, total, "Accepted resolution batch");
    Ok((
        StatusCode::ACCEPTED,
        Json(ResolveResponse { batch_id, total }),
    ))
}

/// GET /resolve/:batch_id - point-in-time snapshot of a batch
pub async fn get_resolve_status(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<BatchSnapshot>> {
    let batches = state.batches.read().await;
    let batch = batches
        .get(&batch_id)
        .ok_or_else(|| ApiError::NotFound(format!("No batch with id {}", batch_id)))?;
    Ok(Json(batch.snapshot()))
}

/// POST /image/regenerate response body
#[derive(Debug, Serialize)]
pub struct RegenerateResponse {
    pub image_url: String,
    pub fallback: bool,
}

/// POST /image/regenerate - re-run the cascade for a single record
///
/// Synchronous: responds once the cascade reached a URL. Used when the user
/// rejects a resolved image and wants another attempt.
pub async fn regenerate_image(
    State(state): State<AppState>,
    Json(record): Json<LocationRecord>,
) -> ApiResult<Json<RegenerateResponse>> {
    let (image_url, fallback) = state.orchestrator.resolve_single(&record).await;
    tracing::info!(location = %record.location, fallback, "Regenerated image");
    Ok(Json(RegenerateResponse {
        image_url,
        fallback,
    }))
}

/// Build resolution routes
pub fn resolve_routes() -> Router<AppState> {
    Router::new()
        .route("/resolve", post(start_resolve))
        .route("/resolve/:batch_id", get(get_resolve_status))
        .route("/image/regenerate", post(regenerate_image))
}
