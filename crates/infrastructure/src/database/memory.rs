use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{
    ClaimOutcome, DurationScope, RequestedTask, RequestedTaskFilter, RequestedTaskRepository,
    ScheduleDuration, ScheduleDurationRepository, ScheduleRepository, Task, TaskMutation,
    TaskRepository, Worker, WorkerRepository,
};

#[derive(Debug, Default)]
struct StoreState {
    workers: HashMap<String, Worker>,
    requested: HashMap<Uuid, RequestedTask>,
    tasks: HashMap<Uuid, Task>,
    durations: HashMap<(String, DurationScope), ScheduleDuration>,
    most_recent: HashMap<String, (Uuid, DateTime<Utc>)>,
}

/// 进程内任务存储
///
/// 所有集合放在同一把锁之后，领取操作在一次写锁内完成删除与创建。
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_pair(a: &RequestedTask, b: &RequestedTask) -> bool {
    a.schedule_name.is_some()
        && a.schedule_name == b.schedule_name
        && a.worker_name == b.worker_name
}

#[async_trait]
impl WorkerRepository for InMemoryStore {
    async fn get_worker(&self, name: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.state.read().await.workers.get(name).cloned())
    }

    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        self.state
            .write()
            .await
            .workers
            .insert(worker.name.clone(), worker.clone());
        Ok(())
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.state.read().await.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }
}

#[async_trait]
impl RequestedTaskRepository for InMemoryStore {
    async fn create_requested_task(&self, task: &RequestedTask) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        if state.requested.values().any(|other| same_pair(other, task)) {
            return Err(SchedulerError::Conflict(format!(
                "schedule {} 已有未领取的请求 (worker: {:?})",
                task.schedule_display_name(),
                task.worker_name
            )));
        }
        state.requested.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_requested_task(&self, id: Uuid) -> SchedulerResult<Option<RequestedTask>> {
        Ok(self.state.read().await.requested.get(&id).cloned())
    }

    async fn list_requested_tasks(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>> {
        let state = self.state.read().await;
        let mut tasks: Vec<RequestedTask> = state
            .requested
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn delete_requested_task(&self, id: Uuid) -> SchedulerResult<bool> {
        Ok(self.state.write().await.requested.remove(&id).is_some())
    }

    async fn claim_requested_task(
        &self,
        id: Uuid,
        worker_name: &str,
    ) -> SchedulerResult<ClaimOutcome> {
        let mut state = self.state.write().await;
        let Some(requested) = state.requested.remove(&id) else {
            debug!("任务 {} 已被领取或不存在", id);
            return Ok(ClaimOutcome::AlreadyClaimed);
        };
        let task = Task::from_requested(requested, worker_name);
        state.tasks.insert(task.id, task.clone());
        Ok(ClaimOutcome::Claimed(Box::new(task)))
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn get_task(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn modify_task<'a>(&self, id: Uuid, mut mutation: TaskMutation<'a>) -> SchedulerResult<Task> {
        let mut state = self.state.write().await;
        let existing = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::task_not_found(id))?;
        // 写锁内修改副本，修改方放弃时不留下半成品
        let mut task = existing.clone();
        if mutation(&mut task) {
            *existing = task.clone();
        }
        Ok(task)
    }

    async fn list_running_tasks(&self) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduleDurationRepository for InMemoryStore {
    async fn get_duration(
        &self,
        schedule_name: &str,
        scope: &DurationScope,
    ) -> SchedulerResult<Option<ScheduleDuration>> {
        Ok(self
            .state
            .read()
            .await
            .durations
            .get(&(schedule_name.to_string(), scope.clone()))
            .cloned())
    }

    async fn upsert_duration(&self, duration: &ScheduleDuration) -> SchedulerResult<()> {
        self.state.write().await.durations.insert(
            (duration.schedule_name.clone(), duration.scope.clone()),
            duration.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryStore {
    async fn link_most_recent_task(
        &self,
        schedule_name: &str,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        self.state
            .write()
            .await
            .most_recent
            .insert(schedule_name.to_string(), (task_id, at));
        Ok(())
    }

    async fn most_recent_task(&self, schedule_name: &str) -> SchedulerResult<Option<Uuid>> {
        Ok(self
            .state
            .read()
            .await
            .most_recent
            .get(schedule_name)
            .map(|(id, _)| *id))
    }
}
