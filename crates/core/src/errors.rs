use thiserror::Error;
use uuid::Uuid;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("Worker未找到: {name}")]
    WorkerNotFound { name: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("待执行任务未找到: {id}")]
    RequestedTaskNotFound { id: Uuid },

    #[error("请求冲突: {0}")]
    Conflict(String),

    #[error("无效的参数: {0}")]
    InvalidParams(String),

    #[error("容器运行时错误: {0}")]
    ContainerRuntime(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn worker_not_found<S: Into<String>>(name: S) -> Self {
        Self::WorkerNotFound { name: name.into() }
    }

    pub fn task_not_found(id: Uuid) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn requested_task_not_found(id: Uuid) -> Self {
        Self::RequestedTaskNotFound { id }
    }

    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// 瞬时基础设施错误，调用方可以有限次重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::DatabaseOperation(_)
                | SchedulerError::ContainerRuntime(_)
                | SchedulerError::Network(_)
                | SchedulerError::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::WorkerNotFound { .. }
                | SchedulerError::TaskNotFound { .. }
                | SchedulerError::RequestedTaskNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}
