//! # Zimfarm API
//!
//! 调度服务的HTTP外壳。Worker通过它执行 offer / claim / 事件上报 / 签到，
//! 管理端通过它新建、撤销、取消任务和暂停Worker。
//!
//! 所有成功响应使用统一的信封：
//!
//! ```json
//! { "success": true, "data": { ... }, "timestamp": "2024-01-01T00:00:00Z" }
//! ```
//!
//! 错误响应：
//!
//! ```json
//! { "success": false, "error": { "type": "TASK_NOT_FOUND", "message": "..." }, "timestamp": "..." }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use zimfarm_dispatcher::SchedulerService;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(service: Arc<SchedulerService>) -> Router {
    let state = AppState { service };

    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
