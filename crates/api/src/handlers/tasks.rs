use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use zimfarm_domain::{ClaimOutcome, EventReport};

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub canceled_by: Option<String>,
}

/// 领取任务；已被领取时返回409
pub async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<impl IntoResponse> {
    match state.service.claim(id, &request.worker_name).await? {
        ClaimOutcome::Claimed(task) => Ok(success(task)),
        ClaimOutcome::AlreadyClaimed => {
            Err(ApiError::Conflict(format!("任务 {id} 已被领取")))
        }
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.get_task(id).await?;
    Ok(success(task))
}

/// Worker上报事件，返回处理后的任务
pub async fn report_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<EventReport>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.report_event(id, &report).await?;
    Ok(success(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.cancel(id, request.canceled_by).await?;
    Ok(success(task))
}
