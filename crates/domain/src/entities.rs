use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{FileStatus, TaskEvent, TaskStatus};
use crate::value_objects::{ContainerStats, Progress, Resources, TaskConfig};

/// 任务所属 schedule 已不存在或从未绑定时显示的名称
pub const NO_SCHEDULE_NAME: &str = "none";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub name: String,
    pub resources: Resources,
    pub offliners: Vec<String>,
    /// platform → 本Worker上的并发上限
    #[serde(default)]
    pub platform_overrides: HashMap<String, u32>,
    #[serde(default)]
    pub selfish: bool,
    #[serde(default)]
    pub cordoned: bool,
    #[serde(default)]
    pub admin_disabled: bool,
    /// context 名称 → 可选的白名单IP
    #[serde(default)]
    pub contexts: HashMap<String, Option<IpAddr>>,
    #[serde(default)]
    pub last_ip: Option<IpAddr>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(name: impl Into<String>, resources: Resources, offliners: Vec<String>) -> Self {
        Self {
            name: name.into(),
            resources,
            offliners,
            platform_overrides: HashMap::new(),
            selfish: false,
            cordoned: false,
            admin_disabled: false,
            contexts: HashMap::new(),
            last_ip: None,
            last_seen: None,
        }
    }

    /// 暂停（自身或管理员）只阻止新任务，不影响运行中的任务
    pub fn accepts_new_tasks(&self) -> bool {
        !self.cordoned && !self.admin_disabled
    }

    pub fn supports_offliner(&self, offliner: &str) -> bool {
        self.offliners.iter().any(|o| o == offliner)
    }

    pub fn accepts_owner(&self, pinned_worker: Option<&str>) -> bool {
        match pinned_worker {
            Some(owner) => owner == self.name,
            None => !self.selfish,
        }
    }

    /// 空context总是匹配；带IP的context要求最近一次来源IP一致
    pub fn accepts_context(&self, context: &str) -> bool {
        if context.is_empty() {
            return true;
        }
        match self.contexts.get(context) {
            None => false,
            Some(None) => true,
            Some(Some(ip)) => self.last_ip.as_ref() == Some(ip),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestedTask {
    pub id: Uuid,
    pub schedule_name: Option<String>,
    pub config: TaskConfig,
    /// 空字符串表示不限制
    #[serde(default)]
    pub context: String,
    pub priority: i32,
    pub worker_name: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    pub events: Vec<TaskEvent>,
    pub timestamps: BTreeMap<TaskStatus, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RequestedTask {
    pub fn new(schedule_name: Option<String>, config: TaskConfig, priority: i32) -> Self {
        let now = Utc::now();
        let mut timestamps = BTreeMap::new();
        timestamps.insert(TaskStatus::Requested, now);
        Self {
            id: Uuid::new_v4(),
            schedule_name,
            config,
            context: String::new(),
            priority,
            worker_name: None,
            requested_by: None,
            events: vec![TaskEvent {
                code: TaskStatus::Requested,
                timestamp: now,
            }],
            timestamps,
            created_at: now,
        }
    }

    pub fn resources(&self) -> &Resources {
        &self.config.resources
    }

    pub fn offliner(&self) -> &str {
        &self.config.offliner
    }

    pub fn schedule_display_name(&self) -> &str {
        self.schedule_name.as_deref().unwrap_or(NO_SCHEDULE_NAME)
    }
}

/// 单个产出文件的状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub name: String,
    pub status: FileStatus,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub check_result: Option<i32>,
    #[serde(default)]
    pub check_log: Option<String>,
    #[serde(default)]
    pub check_upload: Option<FileStatus>,
    #[serde(default)]
    pub created_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uploaded_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_timestamp: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn created(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: FileStatus::Created,
            size: None,
            check_result: None,
            check_log: None,
            check_upload: None,
            created_timestamp: Some(at),
            uploaded_timestamp: None,
            failed_timestamp: None,
            check_timestamp: None,
        }
    }
}

/// 抓取容器的运行记录
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub log: Option<String>,
    pub progress: Option<Progress>,
    pub stats: Option<ContainerStats>,
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DebugRecord {
    pub exception: Option<String>,
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub schedule_name: Option<String>,
    pub worker_name: String,
    pub config: TaskConfig,
    #[serde(default)]
    pub context: String,
    pub priority: i32,
    #[serde(default)]
    pub requested_by: Option<String>,
    pub status: TaskStatus,
    pub events: Vec<TaskEvent>,
    pub timestamps: BTreeMap<TaskStatus, DateTime<Utc>>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub container: ContainerRecord,
    #[serde(default)]
    pub debug: DebugRecord,
    #[serde(default)]
    pub canceled_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 由被领取的 RequestedTask 生成，沿用同一个 id 与请求期的事件
    pub fn from_requested(requested: RequestedTask, worker_name: impl Into<String>) -> Self {
        Self {
            id: requested.id,
            schedule_name: requested.schedule_name,
            worker_name: worker_name.into(),
            config: requested.config,
            context: requested.context,
            priority: requested.priority,
            requested_by: requested.requested_by,
            status: TaskStatus::Requested,
            events: requested.events,
            timestamps: requested.timestamps,
            files: BTreeMap::new(),
            container: ContainerRecord::default(),
            debug: DebugRecord::default(),
            canceled_by: None,
            updated_at: Utc::now(),
        }
    }

    pub fn resources(&self) -> &Resources {
        &self.config.resources
    }

    pub fn offliner(&self) -> &str {
        &self.config.offliner
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 取消已被请求（或已完成）；之后的进度事件会改变status，所以看时间戳
    pub fn is_cancel_marked(&self) -> bool {
        self.status == TaskStatus::Canceled
            || self.timestamps.contains_key(&TaskStatus::CancelRequested)
    }

    /// 用于ETA的开始时间：started 时间戳，否则 requested 时间戳
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.timestamps
            .get(&TaskStatus::Started)
            .or_else(|| self.timestamps.get(&TaskStatus::Requested))
            .copied()
    }

    pub fn schedule_display_name(&self) -> &str {
        self.schedule_name.as_deref().unwrap_or(NO_SCHEDULE_NAME)
    }

    pub fn has_event(&self, event: &TaskEvent) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "scope", content = "worker", rename_all = "snake_case")]
pub enum DurationScope {
    Default,
    Worker(String),
}

/// 某个 schedule 的历史运行时长样本，仅用于ETA估算
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleDuration {
    pub schedule_name: String,
    pub scope: DurationScope,
    pub value_seconds: u64,
    pub observed_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestedTaskFilter {
    #[serde(default)]
    pub offliners: Vec<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub priority_min: Option<i32>,
    #[serde(default)]
    pub schedule_names: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RequestedTaskFilter {
    pub fn matches(&self, task: &RequestedTask) -> bool {
        if !self.offliners.is_empty() && !self.offliners.iter().any(|o| o == task.offliner()) {
            return false;
        }
        if let Some(ref worker) = self.worker_name {
            if task.worker_name.as_deref() != Some(worker.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.priority_min {
            if task.priority < min {
                return false;
            }
        }
        if !self.schedule_names.is_empty()
            && !self
                .schedule_names
                .iter()
                .any(|s| Some(s.as_str()) == task.schedule_name.as_deref())
        {
            return false;
        }
        true
    }
}
