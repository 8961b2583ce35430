use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// CPU/内存/磁盘三维资源量（内存与磁盘以字节计）
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Resources {
    pub cpu: u32,
    pub memory: u64,
    pub disk: u64,
}

impl Resources {
    pub fn new(cpu: u32, memory: u64, disk: u64) -> Self {
        Self { cpu, memory, disk }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0 && self.disk == 0
    }

    /// 三个维度都不超过 `budget`
    pub fn fits_within(&self, budget: &Resources) -> bool {
        self.cpu <= budget.cpu && self.memory <= budget.memory && self.disk <= budget.disk
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
        }
    }

    /// 相对于 `available` 还缺多少；已满足的维度为0
    pub fn shortfall(&self, available: &Resources) -> Resources {
        self.saturating_sub(available)
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(rhs.cpu),
            memory: self.memory.saturating_add(rhs.memory),
            disk: self.disk.saturating_add(rhs.disk),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} memory={} disk={}",
            self.cpu, self.memory, self.disk
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// 上传目标；uri 由上传工具解释（scp/sftp/s3）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTarget {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_days: Option<u32>,
}

impl UploadTarget {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            expiration_days: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTargets {
    #[serde(default)]
    pub zim: Option<UploadTarget>,
    /// 上传前是否对产出文件执行完整性检查
    #[serde(default)]
    pub zimcheck: bool,
    #[serde(default)]
    pub logs: Option<UploadTarget>,
    #[serde(default)]
    pub artifacts: Option<UploadTarget>,
    #[serde(default)]
    pub check: Option<UploadTarget>,
}

/// 任务请求时刻的配置快照，与 schedule 之后的修改无关
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub offliner: String,
    #[serde(default)]
    pub platform: Option<String>,
    pub image: ImageRef,
    #[serde(default)]
    pub command: Vec<String>,
    pub resources: Resources,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub artifacts_globs: Vec<String>,
    #[serde(default)]
    pub upload: UploadTargets,
}

impl TaskConfig {
    pub fn new(offliner: impl Into<String>, image: ImageRef, resources: Resources) -> Self {
        Self {
            offliner: offliner.into(),
            platform: None,
            image,
            command: Vec::new(),
            resources,
            monitor: false,
            artifacts_globs: Vec::new(),
            upload: UploadTargets::default(),
        }
    }
}

/// 抓取程序写入的进度文件内容
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    #[serde(default)]
    pub partial_zim: bool,
}

impl Progress {
    /// 完成百分比，0..=100
    pub fn overall(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let ratio = (self.done.min(self.total) as f64) / (self.total as f64);
        (ratio * 100.0).floor() as u8
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerStats {
    /// 平滑后的CPU百分比
    pub cpu_percent: f64,
    pub memory_max: u64,
    pub disk_max: u64,
}
