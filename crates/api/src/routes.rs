use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use zimfarm_dispatcher::SchedulerService;

use crate::handlers::{
    health::health_check,
    requested_tasks::{
        create_requested_task, delete_requested_task, get_requested_task, list_requested_tasks,
        offer,
    },
    tasks::{cancel_task, claim_task, get_task, report_event},
    workers::{check_in, disable_worker, enable_worker, get_worker, list_workers},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SchedulerService>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 待执行任务
        .route("/v1/requested-tasks/offer", post(offer))
        .route(
            "/v1/requested-tasks",
            get(list_requested_tasks).post(create_requested_task),
        )
        .route(
            "/v1/requested-tasks/{id}",
            get(get_requested_task).delete(delete_requested_task),
        )
        // 任务
        .route("/v1/tasks/{id}", get(get_task).patch(report_event))
        .route("/v1/tasks/{id}/claim", post(claim_task))
        .route("/v1/tasks/{id}/cancel", post(cancel_task))
        // Worker
        .route("/v1/workers", get(list_workers))
        .route("/v1/workers/{name}", get(get_worker))
        .route("/v1/workers/{name}/check-in", post(check_in))
        .route("/v1/workers/{name}/disable", post(disable_worker))
        .route("/v1/workers/{name}/enable", post(enable_worker))
        .with_state(state)
}
