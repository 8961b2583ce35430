use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zimfarm_core::SchedulerResult;

use crate::entities::{RequestedTask, RequestedTaskFilter, Task};
use crate::events::EventReport;
use crate::repositories::ClaimOutcome;
use crate::value_objects::Resources;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferRequest {
    pub worker_name: String,
    pub available: Resources,
    /// 只有进程内后端会填写；HTTP后端由服务端根据连接确定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckIn {
    pub worker_name: String,
    pub resources: Resources,
    pub offliners: Vec<String>,
    #[serde(default)]
    pub platform_overrides: HashMap<String, u32>,
    #[serde(default)]
    pub cordoned: bool,
    #[serde(default)]
    pub selfish: bool,
    /// context名 -> 限定的来源IP
    #[serde(default)]
    pub contexts: HashMap<String, Option<IpAddr>>,
}

/// Worker与调度后端之间的协议
#[async_trait]
pub trait Backend: Send + Sync {
    /// 调度后端的地址或名称，用于日志
    fn name(&self) -> &str;

    async fn offer(&self, request: &OfferRequest) -> SchedulerResult<Option<RequestedTask>>;

    async fn claim(&self, task_id: Uuid, worker_name: &str) -> SchedulerResult<ClaimOutcome>;

    async fn report_event(&self, task_id: Uuid, report: &EventReport) -> SchedulerResult<()>;

    async fn check_in(&self, check_in: &CheckIn) -> SchedulerResult<()>;

    async fn get_job(&self, task_id: Uuid) -> SchedulerResult<Task>;

    async fn get_requested_jobs(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>>;
}
