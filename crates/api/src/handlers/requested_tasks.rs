use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::request::Parts,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use zimfarm_dispatcher::NewRequestedTask;
use zimfarm_domain::{OfferRequest, RequestedTaskFilter};

use crate::{
    error::ApiResult,
    response::{created, deleted, success},
    routes::AppState,
};

/// 轮询Worker的来源地址：优先取反向代理写入的 `X-Forwarded-For` 第一段，
/// 否则取TCP连接的对端地址
#[derive(Debug, Clone, Copy)]
pub struct SourceIp(pub Option<IpAddr>);

impl<S> FromRequestParts<S> for SourceIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return Ok(SourceIp(forwarded));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(SourceIp(peer))
    }
}

/// Worker轮询：至多返回一个可执行的任务，没有时 data 为 null
pub async fn offer(
    State(state): State<AppState>,
    SourceIp(source_ip): SourceIp,
    Json(mut request): Json<OfferRequest>,
) -> ApiResult<impl IntoResponse> {
    request.source_ip = source_ip.or(request.source_ip);
    let task = state.service.offer(&request).await?;
    Ok(success(task))
}

/// 列表查询参数；多值字段用逗号分隔
#[derive(Debug, Default, Deserialize)]
pub struct RequestedTaskQueryParams {
    pub offliners: Option<String>,
    pub worker_name: Option<String>,
    pub priority_min: Option<i32>,
    pub schedule_names: Option<String>,
    pub limit: Option<usize>,
}

impl RequestedTaskQueryParams {
    fn into_filter(self) -> RequestedTaskFilter {
        RequestedTaskFilter {
            offliners: split_list(self.offliners),
            worker_name: self.worker_name,
            priority_min: self.priority_min,
            schedule_names: split_list(self.schedule_names),
            limit: self.limit,
        }
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

pub async fn list_requested_tasks(
    State(state): State<AppState>,
    Query(params): Query<RequestedTaskQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let tasks = state
        .service
        .list_requested_tasks(&params.into_filter())
        .await?;
    Ok(success(tasks))
}

pub async fn create_requested_task(
    State(state): State<AppState>,
    Json(request): Json<NewRequestedTask>,
) -> ApiResult<impl IntoResponse> {
    let requested = state.service.request(request).await?;
    Ok(created(requested))
}

pub async fn get_requested_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let requested = state.service.get_requested_task(id).await?;
    Ok(success(requested))
}

pub async fn delete_requested_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.service.unrequest(id).await?;
    Ok(deleted(format!("待执行任务 {id} 已撤销")))
}
