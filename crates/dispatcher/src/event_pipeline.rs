//! 事件管道
//!
//! 状态码 → 处理函数 的封闭分发表。每个事件：追加事件记录，非静默状态码更新
//! 主状态和时间戳，合并载荷，持久化，最后同步触发通知。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;
use zimfarm_core::SchedulerResult;
use zimfarm_domain::{
    DurationScope, EventPayload, EventReport, FileRecord, FileStatus, Notifier,
    ScheduleDuration, Task, TaskStatus, TaskStore,
};

use crate::durations::completed_duration;
use crate::metrics;

type Handler = fn(&mut Task, &EventReport);

/// 一次事件应用后需要在持久化之后执行的附带动作
#[derive(Debug, Default, PartialEq)]
pub struct Effects {
    pub link_schedule: bool,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub enum Applied {
    Recorded(Effects),
    /// 重复上报或任务已结束
    Ignored,
}

fn handler_for(code: TaskStatus) -> Handler {
    match code {
        TaskStatus::Requested | TaskStatus::Reserved | TaskStatus::Started => merge_container,
        TaskStatus::ScraperStarted => on_scraper_started,
        TaskStatus::ScraperRunning | TaskStatus::ScraperCompleted | TaskStatus::ScraperKilled => {
            merge_container
        }
        TaskStatus::CancelRequested | TaskStatus::Canceled => on_cancel,
        TaskStatus::Succeeded | TaskStatus::Failed => merge_container,
        TaskStatus::CreatedFile => on_created_file,
        TaskStatus::UploadedFile => on_uploaded_file,
        TaskStatus::FailedFile => on_failed_file,
        TaskStatus::CheckedFile => on_checked_file,
        TaskStatus::Update => on_update,
    }
}

fn merge_container(task: &mut Task, report: &EventReport) {
    let payload = &report.payload;
    let container = &mut task.container;
    if let Some(ref image) = payload.image {
        container.image = Some(image.clone());
    }
    if let Some(ref command) = payload.command {
        container.command = Some(command.clone());
    }
    if payload.exit_code.is_some() {
        container.exit_code = payload.exit_code;
    }
    if let Some(ref stdout) = payload.stdout {
        container.stdout = Some(stdout.clone());
    }
    if let Some(ref stderr) = payload.stderr {
        container.stderr = Some(stderr.clone());
    }
    if let Some(ref log) = payload.log {
        container.log = Some(log.clone());
    }
    if payload.progress.is_some() {
        container.progress = payload.progress;
    }
    if payload.stats.is_some() {
        container.stats = payload.stats;
    }
    if let Some(ref extra) = payload.extra {
        container.extra = Some(extra.clone());
    }
    if let Some(ref exception) = payload.exception {
        task.debug.exception = Some(exception.clone());
    }
    if let Some(ref traceback) = payload.traceback {
        task.debug.traceback = Some(traceback.clone());
    }
}

fn on_scraper_started(task: &mut Task, report: &EventReport) {
    merge_container(task, report);
    if task.container.image.is_none() {
        task.container.image = Some(task.config.image.to_string());
    }
    if task.container.command.is_none() {
        task.container.command = Some(task.config.command.clone());
    }
}

fn on_cancel(task: &mut Task, report: &EventReport) {
    merge_container(task, report);
    if task.canceled_by.is_none() {
        task.canceled_by = report.payload.canceled_by.clone();
    }
}

fn file_entry<'a>(task: &'a mut Task, payload: &EventPayload, report: &EventReport) -> Option<&'a mut FileRecord> {
    let file = payload.file.as_ref()?;
    Some(
        task.files
            .entry(file.name.clone())
            .or_insert_with(|| FileRecord::created(file.name.clone(), report.timestamp)),
    )
}

fn on_created_file(task: &mut Task, report: &EventReport) {
    let size = report.payload.file.as_ref().and_then(|f| f.size);
    if let Some(record) = file_entry(task, &report.payload, report) {
        record.status = FileStatus::Created;
        record.created_timestamp = Some(report.timestamp);
        if size.is_some() {
            record.size = size;
        }
    }
}

fn on_uploaded_file(task: &mut Task, report: &EventReport) {
    if let Some(record) = file_entry(task, &report.payload, report) {
        record.status = FileStatus::Uploaded;
        record.uploaded_timestamp = Some(report.timestamp);
    }
}

fn on_failed_file(task: &mut Task, report: &EventReport) {
    if let Some(record) = file_entry(task, &report.payload, report) {
        record.status = FileStatus::Failed;
        record.failed_timestamp = Some(report.timestamp);
    }
}

fn on_checked_file(task: &mut Task, report: &EventReport) {
    let (result, log) = match report.payload.file {
        Some(ref file) => (file.check_result, file.check_log.clone()),
        None => return,
    };
    if let Some(record) = file_entry(task, &report.payload, report) {
        record.check_result = result;
        record.check_log = log;
        record.check_timestamp = Some(report.timestamp);
    }
}

/// 周期性更新：进度、统计、日志，以及文件的中间状态（上传中、检查结果上传）
fn on_update(task: &mut Task, report: &EventReport) {
    merge_container(task, report);
    let Some(file) = report.payload.file.clone() else {
        return;
    };
    if let Some(record) = file_entry(task, &report.payload, report) {
        if let Some(status) = file.status {
            record.status = status;
        }
        if file.check_upload.is_some() {
            record.check_upload = file.check_upload;
        }
        if file.size.is_some() {
            record.size = file.size;
        }
    }
}

/// 将一次上报应用到任务上（不涉及存储）
pub fn apply_report(task: &mut Task, report: &EventReport) -> Applied {
    let event = report.event();
    if task.has_event(&event) {
        debug!(task_id = %task.id, code = %report.code, "重复的事件上报，忽略");
        return Applied::Ignored;
    }
    if task.is_terminal() {
        debug!(task_id = %task.id, code = %report.code, status = %task.status, "任务已结束，忽略事件");
        return Applied::Ignored;
    }

    let first_reserved =
        report.code == TaskStatus::Reserved && !task.timestamps.contains_key(&TaskStatus::Reserved);

    task.events.push(event);
    if !report.code.is_silent() {
        task.status = report.code;
        if report.code.is_repeatable() {
            task.timestamps.insert(report.code, report.timestamp);
        } else {
            task.timestamps.entry(report.code).or_insert(report.timestamp);
        }
    }
    handler_for(report.code)(task, report);
    task.updated_at = Utc::now();

    let duration_seconds = if report.code == TaskStatus::ScraperCompleted
        && report.payload.exit_code == Some(0)
        && task.schedule_name.is_some()
    {
        completed_duration(task)
    } else {
        None
    };

    Applied::Recorded(Effects {
        link_schedule: first_reserved && task.schedule_name.is_some(),
        duration_seconds,
    })
}

pub struct EventPipeline {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn Notifier>,
}

impl EventPipeline {
    pub fn new(store: Arc<dyn TaskStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// 在存储的原子修改内应用事件，写回成功后再执行附带动作和通知
    pub async fn process(&self, task_id: Uuid, report: &EventReport) -> SchedulerResult<Task> {
        let mut applied = Applied::Ignored;
        let task = self
            .store
            .modify_task(
                task_id,
                Box::new(|task| {
                    applied = apply_report(task, report);
                    matches!(applied, Applied::Recorded(_))
                }),
            )
            .await?;
        let Applied::Recorded(effects) = applied else {
            return Ok(task);
        };
        metrics::record_event(report.code);

        if let Some(ref schedule) = task.schedule_name {
            if effects.link_schedule {
                self.store
                    .link_most_recent_task(schedule, task.id, report.timestamp)
                    .await?;
            }
            if let Some(seconds) = effects.duration_seconds {
                self.record_duration(schedule, &task.worker_name, seconds).await?;
            }
        }

        if !report.code.is_silent() {
            info!(task_id = %task.id, worker = %task.worker_name, code = %report.code, "任务状态更新");
        }
        self.notifier.notify(&task, report.code).await;
        Ok(task)
    }

    async fn record_duration(&self, schedule: &str, worker: &str, seconds: u64) -> SchedulerResult<()> {
        let now = Utc::now();
        self.store
            .upsert_duration(&ScheduleDuration {
                schedule_name: schedule.to_string(),
                scope: DurationScope::Worker(worker.to_string()),
                value_seconds: seconds,
                observed_on: now,
            })
            .await?;
        // schedule 第一次完成时同时建立默认行
        if self
            .store
            .get_duration(schedule, &DurationScope::Default)
            .await?
            .is_none()
        {
            self.store
                .upsert_duration(&ScheduleDuration {
                    schedule_name: schedule.to_string(),
                    scope: DurationScope::Default,
                    value_seconds: seconds,
                    observed_on: now,
                })
                .await?;
        }
        debug!(schedule, worker, seconds, "更新历史时长");
        Ok(())
    }
}
