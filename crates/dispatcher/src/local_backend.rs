use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use zimfarm_core::SchedulerResult;
use zimfarm_domain::{
    Backend, CheckIn, ClaimOutcome, EventReport, OfferRequest, RequestedTask,
    RequestedTaskFilter, Task,
};

use crate::service::SchedulerService;

/// 进程内后端：调度服务与Worker运行在同一进程时使用
#[derive(Clone)]
pub struct LocalBackend {
    service: Arc<SchedulerService>,
}

impl LocalBackend {
    pub fn new(service: Arc<SchedulerService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn offer(&self, request: &OfferRequest) -> SchedulerResult<Option<RequestedTask>> {
        self.service.offer(request).await
    }

    async fn claim(&self, task_id: Uuid, worker_name: &str) -> SchedulerResult<ClaimOutcome> {
        self.service.claim(task_id, worker_name).await
    }

    async fn report_event(&self, task_id: Uuid, report: &EventReport) -> SchedulerResult<()> {
        self.service.report_event(task_id, report).await.map(|_| ())
    }

    async fn check_in(&self, check_in: &CheckIn) -> SchedulerResult<()> {
        self.service.check_in(check_in).await.map(|_| ())
    }

    async fn get_job(&self, task_id: Uuid) -> SchedulerResult<Task> {
        self.service.get_task(task_id).await
    }

    async fn get_requested_jobs(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>> {
        self.service.list_requested_tasks(filter).await
    }
}
