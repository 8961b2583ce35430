use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use zimfarm_domain::CheckIn;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

/// Worker签到；路径中的名称必须与请求体一致
pub async fn check_in(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(check_in): Json<CheckIn>,
) -> ApiResult<impl IntoResponse> {
    if check_in.worker_name != name {
        return Err(ApiError::BadRequest(format!(
            "路径中的Worker {name} 与请求体中的 {} 不一致",
            check_in.worker_name
        )));
    }
    let worker = state.service.check_in(&check_in).await?;
    Ok(success(worker))
}

pub async fn list_workers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let workers = state.service.list_workers().await?;
    Ok(success(workers))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let worker = state.service.get_worker(&name).await?;
    Ok(success(worker))
}

pub async fn disable_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let worker = state.service.set_worker_disabled(&name, true).await?;
    Ok(success(worker))
}

pub async fn enable_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let worker = state.service.set_worker_disabled(&name, false).await?;
    Ok(success(worker))
}
