//! 领域仓储抽象
//!
//! 定义任务存储的抽象接口，遵循依赖倒置原则。方法名带上实体前缀，
//! 同一个存储类型实现全部trait时调用不会产生歧义。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use zimfarm_core::SchedulerResult;

use crate::entities::{
    DurationScope, RequestedTask, RequestedTaskFilter, ScheduleDuration, Task, Worker,
};

/// 领取结果；竞争失败是正常结果而不是错误
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Box<Task>),
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Worker仓储抽象
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn get_worker(&self, name: &str) -> SchedulerResult<Option<Worker>>;
    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()>;
    async fn list_workers(&self) -> SchedulerResult<Vec<Worker>>;
}

/// 待执行任务仓储抽象
#[async_trait]
pub trait RequestedTaskRepository: Send + Sync {
    /// 同一 (schedule, worker) 已有未领取请求时返回 `Conflict`
    async fn create_requested_task(&self, task: &RequestedTask) -> SchedulerResult<()>;
    async fn get_requested_task(&self, id: Uuid) -> SchedulerResult<Option<RequestedTask>>;
    async fn list_requested_tasks(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>>;
    async fn delete_requested_task(&self, id: Uuid) -> SchedulerResult<bool>;
    /// 原子地删除请求并创建同id的Task；并发领取时只有一个成功
    async fn claim_requested_task(
        &self,
        id: Uuid,
        worker_name: &str,
    ) -> SchedulerResult<ClaimOutcome>;
}

/// 对任务的一次就地修改；返回 `false` 表示无需写回
///
/// 存储可能在写冲突后对最新版本重新调用，修改必须只依赖传入的任务。
pub type TaskMutation<'a> = Box<dyn FnMut(&mut Task) -> bool + Send + 'a>;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: Uuid) -> SchedulerResult<Option<Task>>;
    /// 读取、修改、写回在存储层原子完成，返回修改后的任务；任务不存在时返回 `TaskNotFound`
    async fn modify_task<'a>(&self, id: Uuid, mutation: TaskMutation<'a>) -> SchedulerResult<Task>;
    /// 所有未到达终态的任务
    async fn list_running_tasks(&self) -> SchedulerResult<Vec<Task>>;
}

#[async_trait]
pub trait ScheduleDurationRepository: Send + Sync {
    async fn get_duration(
        &self,
        schedule_name: &str,
        scope: &DurationScope,
    ) -> SchedulerResult<Option<ScheduleDuration>>;
    /// 按 (schedule, scope) 替换
    async fn upsert_duration(&self, duration: &ScheduleDuration) -> SchedulerResult<()>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn link_most_recent_task(
        &self,
        schedule_name: &str,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> SchedulerResult<()>;
    async fn most_recent_task(&self, schedule_name: &str) -> SchedulerResult<Option<Uuid>>;
}

/// 完整的任务存储
pub trait TaskStore:
    WorkerRepository
    + RequestedTaskRepository
    + TaskRepository
    + ScheduleDurationRepository
    + ScheduleRepository
{
}

impl<T> TaskStore for T where
    T: WorkerRepository
        + RequestedTaskRepository
        + TaskRepository
        + ScheduleDurationRepository
        + ScheduleRepository
{
}
