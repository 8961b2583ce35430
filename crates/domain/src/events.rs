//! 任务状态码与事件载荷
//!
//! 状态码是封闭集合：执行器上报、事件管道分发、通知订阅都使用同一组取值。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zimfarm_core::SchedulerError;

use crate::value_objects::{ContainerStats, Progress};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Requested,
    Reserved,
    Started,
    ScraperStarted,
    ScraperRunning,
    ScraperCompleted,
    ScraperKilled,
    CancelRequested,
    Canceled,
    Succeeded,
    Failed,
    CreatedFile,
    UploadedFile,
    FailedFile,
    CheckedFile,
    Update,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 16] = [
        TaskStatus::Requested,
        TaskStatus::Reserved,
        TaskStatus::Started,
        TaskStatus::ScraperStarted,
        TaskStatus::ScraperRunning,
        TaskStatus::ScraperCompleted,
        TaskStatus::ScraperKilled,
        TaskStatus::CancelRequested,
        TaskStatus::Canceled,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::CreatedFile,
        TaskStatus::UploadedFile,
        TaskStatus::FailedFile,
        TaskStatus::CheckedFile,
        TaskStatus::Update,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Requested => "requested",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Started => "started",
            TaskStatus::ScraperStarted => "scraper_started",
            TaskStatus::ScraperRunning => "scraper_running",
            TaskStatus::ScraperCompleted => "scraper_completed",
            TaskStatus::ScraperKilled => "scraper_killed",
            TaskStatus::CancelRequested => "cancel_requested",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::CreatedFile => "created_file",
            TaskStatus::UploadedFile => "uploaded_file",
            TaskStatus::FailedFile => "failed_file",
            TaskStatus::CheckedFile => "checked_file",
            TaskStatus::Update => "update",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// 只记录事件，不改变主状态和时间戳
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            TaskStatus::Update
                | TaskStatus::CreatedFile
                | TaskStatus::UploadedFile
                | TaskStatus::FailedFile
                | TaskStatus::CheckedFile
        )
    }

    /// 可重复上报，时间戳以最后一次为准
    pub fn is_repeatable(&self) -> bool {
        matches!(self, TaskStatus::ScraperRunning)
    }

    pub fn is_file_event(&self) -> bool {
        matches!(
            self,
            TaskStatus::CreatedFile
                | TaskStatus::UploadedFile
                | TaskStatus::FailedFile
                | TaskStatus::CheckedFile
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SchedulerError::invalid_params(format!("未知的状态码: {s}")))
    }
}

/// 事件日志中的一条记录
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskEvent {
    pub code: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

/// 产出文件的上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Created,
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilePayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    /// 完整性检查的退出码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_result: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_upload: Option<FileStatus>,
}

impl FilePayload {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// 事件的附带数据，所有字段可选
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FilePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContainerStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_by: Option<String>,
    /// 各offliner特有的附加数据，原样保存
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// 一次事件上报：状态码 + 发送方时间戳 + 载荷
///
/// 时间戳由发送方生成，重传时保持不变，接收方据此去重。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventReport {
    pub code: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: EventPayload,
}

impl EventReport {
    pub fn new(code: TaskStatus) -> Self {
        Self {
            code,
            timestamp: Utc::now(),
            payload: EventPayload::default(),
        }
    }

    pub fn at(code: TaskStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            code,
            timestamp,
            payload: EventPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn event(&self) -> TaskEvent {
        TaskEvent {
            code: self.code,
            timestamp: self.timestamp,
        }
    }
}
