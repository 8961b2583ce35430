//! 容器角色与命名
//!
//! 名字格式 `<任务短id>_<角色>[_<文件名>]`，所有容器都带 task_id 和 role 标签。

use std::collections::BTreeMap;

use uuid::Uuid;
use zimfarm_domain::{Resources, TaskConfig};
use zimfarm_infrastructure::{
    LABEL_CPU, LABEL_DISK, LABEL_MEMORY, LABEL_OFFLINER, LABEL_ROLE, LABEL_TASK_ID,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContainerRole {
    /// 运行 Task Executor 的容器，由 Fleet Manager 启动
    TaskWorker,
    Dnscache,
    Monitor,
    Scraper,
    ZimUploader(String),
    Checker(String),
    CheckUploader(String),
    LogUploader,
    ArtifactsUploader,
}

impl ContainerRole {
    pub const TASK_WORKER: &'static str = "task_worker";
    pub const SCRAPER: &'static str = "scraper";

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRole::TaskWorker => Self::TASK_WORKER,
            ContainerRole::Dnscache => "dnscache",
            ContainerRole::Monitor => "monitor",
            ContainerRole::Scraper => Self::SCRAPER,
            ContainerRole::ZimUploader(_) => "zim_uploader",
            ContainerRole::Checker(_) => "checker",
            ContainerRole::CheckUploader(_) => "check_uploader",
            ContainerRole::LogUploader => "log_uploader",
            ContainerRole::ArtifactsUploader => "artifacts_uploader",
        }
    }

    pub fn file(&self) -> Option<&str> {
        match self {
            ContainerRole::ZimUploader(file)
            | ContainerRole::Checker(file)
            | ContainerRole::CheckUploader(file) => Some(file),
            _ => None,
        }
    }

    pub fn container_name(&self, task_id: Uuid) -> String {
        let mut name = format!("{}_{}", short_id(task_id), self.as_str());
        if let Some(file) = self.file() {
            name.push('_');
            name.push_str(&sanitize(file));
        }
        name
    }

    pub fn labels(&self, task_id: Uuid) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_TASK_ID.to_string(), task_id.to_string());
        labels.insert(LABEL_ROLE.to_string(), self.as_str().to_string());
        labels
    }

    /// task_worker 与 scraper 额外携带资源预留和offliner标签
    pub fn reservation_labels(&self, task_id: Uuid, config: &TaskConfig) -> BTreeMap<String, String> {
        let mut labels = self.labels(task_id);
        labels.extend(resource_labels(&config.resources));
        labels.insert(LABEL_OFFLINER.to_string(), config.offliner.clone());
        labels
    }
}

pub fn resource_labels(resources: &Resources) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CPU.to_string(), resources.cpu.to_string()),
        (LABEL_MEMORY.to_string(), resources.memory.to_string()),
        (LABEL_DISK.to_string(), resources.disk.to_string()),
    ])
}

pub fn short_id(task_id: Uuid) -> String {
    task_id.simple().to_string().chars().take(8).collect()
}

/// 容器名只允许 [a-zA-Z0-9_.-]
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
