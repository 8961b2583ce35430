use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entities::Worker;
use crate::value_objects::TaskConfig;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformLimits {
    pub global_max: Option<u32>,
    pub per_worker_default: Option<u32>,
}

/// 按平台划分的并发上限，只读，注入到匹配器中
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformPolicy {
    limits: HashMap<String, PlatformLimits>,
    offliner_platforms: HashMap<String, String>,
}

impl PlatformPolicy {
    pub fn new(
        limits: HashMap<String, PlatformLimits>,
        offliner_platforms: HashMap<String, String>,
    ) -> Self {
        Self {
            limits,
            offliner_platforms,
        }
    }

    pub fn with_limit(mut self, platform: impl Into<String>, limits: PlatformLimits) -> Self {
        self.limits.insert(platform.into(), limits);
        self
    }

    pub fn with_offliner_platform(
        mut self,
        offliner: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        self.offliner_platforms
            .insert(offliner.into(), platform.into());
        self
    }

    /// 任务配置显式指定 > offliner映射 > offliner本身
    pub fn platform_for<'a>(&'a self, config: &'a TaskConfig) -> &'a str {
        if let Some(ref platform) = config.platform {
            return platform;
        }
        self.offliner_platforms
            .get(&config.offliner)
            .map(String::as_str)
            .unwrap_or(&config.offliner)
    }

    pub fn global_max(&self, platform: &str) -> Option<u32> {
        self.limits.get(platform).and_then(|l| l.global_max)
    }

    /// Worker自身的覆盖值优先于默认值；None 表示不限制
    pub fn per_worker_max(&self, platform: &str, worker: &Worker) -> Option<u32> {
        worker
            .platform_overrides
            .get(platform)
            .copied()
            .or_else(|| self.limits.get(platform).and_then(|l| l.per_worker_default))
    }
}
