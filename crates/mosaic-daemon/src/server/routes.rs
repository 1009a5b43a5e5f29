use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocator::Recommendation;
use crate::engine::{AllocateRequest, ExecuteRequest, RecommendModel, StatusReport};
use crate::orchestration::ExecutionResult;
use crate::session::Placement;

use super::AppState;
use super::error::ApiError;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /status`: devices and active placements.
pub async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.engine.status().await)
}

/// `POST /allocate`
pub async fn allocate(
    State(state): State<AppState>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> ApiResult<Placement> {
    let Json(req) = payload?;
    info!(model_id = %req.model_id, amount = req.capacity_requirement, "Allocate requested");
    Ok(Json(state.engine.allocate(req).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub model_id: String,
    pub ref_count: usize,
}

/// `POST /release`. Drops one reference; capacity is freed lazily.
pub async fn release(
    State(state): State<AppState>,
    payload: Result<Json<ReleaseRequest>, JsonRejection>,
) -> ApiResult<ReleaseResponse> {
    let Json(req) = payload?;
    let ref_count = state.engine.release(&req.model_id)?;
    Ok(Json(ReleaseResponse {
        model_id: req.model_id,
        ref_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecommendRequest {
    pub models: Vec<RecommendModel>,
}

#[derive(Debug, Serialize)]
pub struct RecommendResponse {
    pub assignments: Vec<Recommendation>,
}

/// `POST /recommend`. Dry run, nothing is committed.
pub async fn recommend(
    State(state): State<AppState>,
    payload: Result<Json<RecommendRequest>, JsonRejection>,
) -> ApiResult<RecommendResponse> {
    let Json(req) = payload?;
    let assignments = state.engine.recommend(&req.models).await?;
    Ok(Json(RecommendResponse { assignments }))
}

/// `POST /execute`. Dropping the connection cancels the request.
pub async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<ExecutionResult> {
    let Json(req) = payload?;
    Ok(Json(state.engine.execute(req).await?))
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    pub request_id: String,
}

/// `POST /abort`
pub async fn abort(
    State(state): State<AppState>,
    payload: Result<Json<AbortRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    state.engine.abort(&req.request_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "request_id": req.request_id, "status": "aborting" })),
    ))
}
