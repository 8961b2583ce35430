//! 容器运行时抽象
//!
//! Worker侧的所有容器操作（账本统计、执行器编排、取消）都经过这个trait。

pub mod docker;

pub use docker::DockerCli;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zimfarm_core::SchedulerResult;

pub const LABEL_TASK_ID: &str = "zimfarm.task_id";
pub const LABEL_ROLE: &str = "zimfarm.role";
pub const LABEL_OFFLINER: &str = "zimfarm.offliner";
pub const LABEL_CPU: &str = "zimfarm.resources.cpu";
pub const LABEL_MEMORY: &str = "zimfarm.resources.memory";
pub const LABEL_DISK: &str = "zimfarm.resources.disk";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// 启动一个分离运行的容器所需的全部参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub dns: Vec<String>,
    pub working_dir: Option<String>,
    pub cpu_shares: Option<u32>,
    pub memory_limit: Option<u64>,
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i32),
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Created)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ContainerState::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    pub ip_address: Option<String>,
}

impl ContainerInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> SchedulerResult<()>;

    /// 分离运行，返回容器id
    async fn run(&self, spec: &ContainerSpec) -> SchedulerResult<String>;

    /// 容器不存在时返回 None
    async fn inspect(&self, name: &str) -> SchedulerResult<Option<ContainerInfo>>;

    /// 列出同时带有全部给定标签的容器（含已退出的）
    async fn list(&self, labels: &[(&str, &str)]) -> SchedulerResult<Vec<ContainerInfo>>;

    async fn stop(&self, name: &str, grace: Duration) -> SchedulerResult<()>;

    async fn remove(&self, name: &str) -> SchedulerResult<()>;

    async fn logs(&self, name: &str, tail: Option<usize>) -> SchedulerResult<ContainerLogs>;

    async fn usage(&self, name: &str) -> SchedulerResult<Option<ContainerUsage>>;
}
