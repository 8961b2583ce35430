use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;
use zimfarm_core::SchedulerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求冲突: {0}")]
    Conflict(String),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Scheduler(SchedulerError::WorkerNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "WORKER_NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::TaskNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "TASK_NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::RequestedTaskNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "REQUESTED_TASK_NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::Conflict(_)) | ApiError::Conflict(_) => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            ApiError::Scheduler(SchedulerError::InvalidParams(_)) | ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST")
            }
            ApiError::Scheduler(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        let message = match &self {
            ApiError::Scheduler(inner) => inner.to_string(),
            ApiError::Conflict(msg) | ApiError::BadRequest(msg) => msg.clone(),
        };
        if status.is_server_error() {
            error!(error = %self, "请求处理失败");
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "type": error_type,
                "message": message,
            },
            "timestamp": chrono::Utc::now(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SchedulerError::worker_not_found("w1"), StatusCode::NOT_FOUND),
            (SchedulerError::task_not_found(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (SchedulerError::Conflict("dup".into()), StatusCode::CONFLICT),
            (SchedulerError::invalid_params("bad"), StatusCode::BAD_REQUEST),
            (SchedulerError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
        assert_eq!(
            ApiError::Conflict("claimed".into()).into_response().status(),
            StatusCode::CONFLICT
        );
    }
}
