//! 调度服务
//!
//! Worker↔后端协议的服务端实现：offer / claim / report_event / check_in，
//! 以及请求、撤销、取消和读取接口。HTTP层和进程内后端都只是它的薄包装。

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zimfarm_config::DispatcherConfig;
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{
    CheckIn, ClaimOutcome, DurationScope, EventPayload, EventReport, IpChangeListener, Notifier,
    OfferRequest, PlatformPolicy, RequestedTask, RequestedTaskFilter, Task, TaskConfig,
    TaskStatus, TaskStore, Worker,
};

use crate::durations::DurationTable;
use crate::event_pipeline::EventPipeline;
use crate::matcher::{MatchInput, MatchOutcome, TaskMatcher};
use crate::metrics;
use crate::policy_from_config;

/// 新建待执行任务的参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRequestedTask {
    #[serde(default)]
    pub schedule_name: Option<String>,
    pub config: TaskConfig,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl NewRequestedTask {
    pub fn new(config: TaskConfig) -> Self {
        Self {
            schedule_name: None,
            config,
            priority: 0,
            worker_name: None,
            context: String::new(),
            requested_by: None,
        }
    }
}

pub struct SchedulerService {
    store: Arc<dyn TaskStore>,
    matcher: TaskMatcher,
    pipeline: EventPipeline,
    ip_listener: Arc<dyn IpChangeListener>,
    default_duration_seconds: u64,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        policy: PlatformPolicy,
        notifier: Arc<dyn Notifier>,
        ip_listener: Arc<dyn IpChangeListener>,
        default_duration_seconds: u64,
    ) -> Self {
        Self {
            pipeline: EventPipeline::new(store.clone(), notifier),
            store,
            matcher: TaskMatcher::new(policy),
            ip_listener,
            default_duration_seconds,
        }
    }

    pub fn from_config(
        config: &DispatcherConfig,
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn Notifier>,
        ip_listener: Arc<dyn IpChangeListener>,
    ) -> Self {
        Self::new(
            store,
            policy_from_config(config),
            notifier,
            ip_listener,
            config.default_duration_seconds,
        )
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 为轮询中的Worker挑选至多一个任务；同时刷新Worker的最近在线时间和来源IP
    pub async fn offer(&self, request: &OfferRequest) -> SchedulerResult<Option<RequestedTask>> {
        let started = Instant::now();
        let mut worker = self
            .store
            .get_worker(&request.worker_name)
            .await?
            .ok_or_else(|| SchedulerError::worker_not_found(&request.worker_name))?;
        self.touch_worker(&mut worker, request.source_ip).await?;

        let requested = self
            .store
            .list_requested_tasks(&RequestedTaskFilter::default())
            .await?;
        metrics::record_queue_depth(requested.len());
        let running = self.store.list_running_tasks().await?;
        let durations = self.load_durations(&worker, &requested, &running).await?;

        let input = MatchInput {
            worker: &worker,
            available: request.available,
            requested: &requested,
            running: &running,
            durations: &durations,
            now: Utc::now(),
        };
        let outcome = self.matcher.find_task(&input);
        metrics::record_offer(&worker.name, &outcome);
        metrics::record_offer_latency(started.elapsed().as_secs_f64());

        match &outcome {
            MatchOutcome::Immediate(task) => {
                info!(worker = %worker.name, task_id = %task.id, "分配任务");
            }
            MatchOutcome::Backfill {
                task,
                window_seconds,
            } => {
                info!(worker = %worker.name, task_id = %task.id, window_seconds, "回填分配任务");
            }
            MatchOutcome::NoMatch => {
                debug!(worker = %worker.name, available = %request.available, "没有可分配的任务");
            }
        }
        Ok(outcome.task().cloned())
    }

    async fn touch_worker(&self, worker: &mut Worker, source_ip: Option<IpAddr>) -> SchedulerResult<()> {
        let previous = worker.last_ip;
        worker.last_seen = Some(Utc::now());
        if let Some(ip) = source_ip {
            worker.last_ip = Some(ip);
        }
        self.store.upsert_worker(worker).await?;

        if let Some(ip) = source_ip {
            if previous != Some(ip) {
                self.ip_listener.on_ip_changed(worker, previous, ip).await;
            }
        }
        Ok(())
    }

    /// 只查询候选和运行中任务涉及到的schedule
    async fn load_durations(
        &self,
        worker: &Worker,
        requested: &[RequestedTask],
        running: &[Task],
    ) -> SchedulerResult<DurationTable> {
        let schedules: BTreeSet<&str> = requested
            .iter()
            .filter_map(|t| t.schedule_name.as_deref())
            .chain(
                running
                    .iter()
                    .filter(|t| t.worker_name == worker.name)
                    .filter_map(|t| t.schedule_name.as_deref()),
            )
            .collect();

        let mut table = DurationTable::new(self.default_duration_seconds);
        let worker_scope = DurationScope::Worker(worker.name.clone());
        for schedule in schedules {
            for scope in [&DurationScope::Default, &worker_scope] {
                if let Some(duration) = self.store.get_duration(schedule, scope).await? {
                    table.insert(&duration);
                }
            }
        }
        Ok(table)
    }

    /// 原子领取；竞争失败返回 `AlreadyClaimed`，不产生副作用
    pub async fn claim(&self, task_id: Uuid, worker_name: &str) -> SchedulerResult<ClaimOutcome> {
        let worker = self
            .store
            .get_worker(worker_name)
            .await?
            .ok_or_else(|| SchedulerError::worker_not_found(worker_name))?;
        if let Some(requested) = self.store.get_requested_task(task_id).await? {
            if !worker.accepts_owner(requested.worker_name.as_deref()) {
                return Err(SchedulerError::Conflict(format!(
                    "任务 {task_id} 不属于Worker {worker_name}"
                )));
            }
        }

        match self.store.claim_requested_task(task_id, worker_name).await? {
            ClaimOutcome::Claimed(_) => {
                metrics::record_claim(true);
                let task = self
                    .pipeline
                    .process(task_id, &EventReport::new(TaskStatus::Reserved))
                    .await?;
                info!(%task_id, worker = worker_name, "任务已被领取");
                Ok(ClaimOutcome::Claimed(Box::new(task)))
            }
            ClaimOutcome::AlreadyClaimed => {
                metrics::record_claim(false);
                debug!(%task_id, worker = worker_name, "任务已被其他Worker领取");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
        }
    }

    pub async fn report_event(&self, task_id: Uuid, report: &EventReport) -> SchedulerResult<Task> {
        self.pipeline.process(task_id, report).await
    }

    /// 更新Worker声明的容量和能力；首次签到时创建Worker
    pub async fn check_in(&self, check_in: &CheckIn) -> SchedulerResult<Worker> {
        let mut worker = match self.store.get_worker(&check_in.worker_name).await? {
            Some(worker) => worker,
            None => {
                info!(worker = %check_in.worker_name, "新Worker首次签到");
                Worker::new(
                    check_in.worker_name.clone(),
                    check_in.resources,
                    check_in.offliners.clone(),
                )
            }
        };
        worker.resources = check_in.resources;
        worker.offliners = check_in.offliners.clone();
        worker.platform_overrides = check_in.platform_overrides.clone();
        worker.cordoned = check_in.cordoned;
        worker.selfish = check_in.selfish;
        worker.contexts = check_in.contexts.clone();
        worker.last_seen = Some(Utc::now());
        self.store.upsert_worker(&worker).await?;

        debug!(
            worker = %worker.name,
            resources = %worker.resources,
            cordoned = worker.cordoned,
            selfish = worker.selfish,
            contexts = worker.contexts.len(),
            "Worker签到"
        );
        Ok(worker)
    }

    pub async fn request(&self, new: NewRequestedTask) -> SchedulerResult<RequestedTask> {
        if new.config.offliner.trim().is_empty() {
            return Err(SchedulerError::invalid_params("offliner不能为空"));
        }
        if new.config.resources.is_zero() {
            return Err(SchedulerError::invalid_params("资源需求不能全部为0"));
        }
        if let Some(ref worker) = new.worker_name {
            if self.store.get_worker(worker).await?.is_none() {
                return Err(SchedulerError::worker_not_found(worker));
            }
        }

        let mut requested = RequestedTask::new(new.schedule_name, new.config, new.priority);
        requested.worker_name = new.worker_name;
        requested.context = new.context;
        requested.requested_by = new.requested_by;
        self.store.create_requested_task(&requested).await?;

        info!(
            task_id = %requested.id,
            schedule = requested.schedule_display_name(),
            priority = requested.priority,
            "新建待执行任务"
        );
        Ok(requested)
    }

    pub async fn unrequest(&self, id: Uuid) -> SchedulerResult<()> {
        if !self.store.delete_requested_task(id).await? {
            return Err(SchedulerError::requested_task_not_found(id));
        }
        info!(task_id = %id, "撤销待执行任务");
        Ok(())
    }

    /// 标记取消；实际停止由持有该任务的Worker在下一次巡检时完成
    pub async fn cancel(&self, task_id: Uuid, canceled_by: Option<String>) -> SchedulerResult<Task> {
        let task = self.get_task(task_id).await?;
        if task.is_terminal() {
            return Err(SchedulerError::Conflict(format!(
                "任务 {task_id} 已处于终态 {}",
                task.status
            )));
        }
        if task.is_cancel_marked() {
            warn!(%task_id, "任务已在取消中");
            return Ok(task);
        }

        let report = EventReport::new(TaskStatus::CancelRequested).with_payload(EventPayload {
            canceled_by,
            ..Default::default()
        });
        self.pipeline.process(task_id, &report).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> SchedulerResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    pub async fn get_requested_task(&self, id: Uuid) -> SchedulerResult<RequestedTask> {
        self.store
            .get_requested_task(id)
            .await?
            .ok_or_else(|| SchedulerError::requested_task_not_found(id))
    }

    pub async fn list_requested_tasks(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>> {
        self.store.list_requested_tasks(filter).await
    }

    pub async fn get_worker(&self, name: &str) -> SchedulerResult<Worker> {
        self.store
            .get_worker(name)
            .await?
            .ok_or_else(|| SchedulerError::worker_not_found(name))
    }

    pub async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        self.store.list_workers().await
    }

    /// 管理员暂停或恢复Worker；不影响运行中的任务
    pub async fn set_worker_disabled(&self, name: &str, disabled: bool) -> SchedulerResult<Worker> {
        let mut worker = self.get_worker(name).await?;
        worker.admin_disabled = disabled;
        self.store.upsert_worker(&worker).await?;
        info!(worker = name, disabled, "更新Worker管理状态");
        Ok(worker)
    }
}
