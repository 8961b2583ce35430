use std::collections::HashMap;
use std::net::IpAddr;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 单个平台的并发上限
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlatformLimitsConfig {
    /// 整个集群同时运行的上限
    pub global_max: Option<u32>,
    /// 单个Worker默认上限（Worker可自行覆盖）
    pub per_worker_default: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// 无历史时长时用于ETA估算的默认值
    pub default_duration_seconds: u64,
    #[serde(default)]
    pub platforms: HashMap<String, PlatformLimitsConfig>,
    /// offliner → platform；未列出的offliner以自身为平台
    #[serde(default)]
    pub offliner_platforms: HashMap<String, String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8000".to_string(),
            default_duration_seconds: 86400,
            platforms: HashMap::new(),
            offliner_platforms: HashMap::new(),
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.bind_address, "dispatcher.bind_address")?;

        if self.default_duration_seconds == 0 {
            return Err(crate::ConfigError::Validation(
                "dispatcher.default_duration_seconds must be greater than 0".to_string(),
            ));
        }

        for (platform, limits) in &self.platforms {
            ValidationUtils::validate_not_empty(platform, "dispatcher.platforms")?;
            if limits.global_max == Some(0) || limits.per_worker_default == Some(0) {
                return Err(crate::ConfigError::Validation(format!(
                    "dispatcher.platforms.{platform}: limits must be greater than 0 when set"
                )));
            }
        }

        Ok(())
    }
}

/// Worker 提供的一个 context；带 `ip` 时只在该来源IP下生效
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerContextConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub name: String,
    /// 轮询使用的后端地址，按轮转顺序使用
    pub backends: Vec<String>,
    pub cpu: u32,
    pub memory: u64,
    pub disk: u64,
    pub offliners: Vec<String>,
    #[serde(default)]
    pub platform_overrides: HashMap<String, u32>,
    #[serde(default)]
    pub cordoned: bool,
    /// 只接受指定给本Worker的任务
    #[serde(default)]
    pub selfish: bool,
    #[serde(default)]
    pub contexts: Vec<WorkerContextConfig>,
    pub poll_interval_seconds: u64,
    pub check_in_interval_seconds: u64,
    pub claim_cooldown_seconds: u64,
    pub workdir: String,
    pub task_worker_image: String,
    /// 停止执行器容器时，在执行器取消预算之外额外留出的时间
    pub stop_grace_seconds: u64,
    pub request_retries: u32,
    pub request_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "worker-001".to_string(),
            backends: vec!["http://localhost:8000".to_string()],
            cpu: 3,
            memory: 1024 * 1024 * 1024 * 4,
            disk: 1024 * 1024 * 1024 * 50,
            offliners: vec!["mwoffliner".to_string()],
            platform_overrides: HashMap::new(),
            cordoned: false,
            selfish: false,
            contexts: Vec::new(),
            poll_interval_seconds: 180,
            check_in_interval_seconds: 600,
            claim_cooldown_seconds: 30,
            workdir: "/data".to_string(),
            task_worker_image: "ghcr.io/openzim/zimfarm-task-worker:latest".to_string(),
            stop_grace_seconds: 30,
            request_retries: 3,
            request_backoff_ms: 500,
        }
    }
}

impl WorkerConfig {
    /// check-in 时上报的 context 表
    pub fn context_map(&self) -> HashMap<String, Option<IpAddr>> {
        self.contexts
            .iter()
            .map(|context| (context.name.clone(), context.ip))
            .collect()
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.name, "worker.name")?;
        ValidationUtils::validate_not_empty(&self.workdir, "worker.workdir")?;
        ValidationUtils::validate_not_empty(&self.task_worker_image, "worker.task_worker_image")?;

        if self.backends.is_empty() {
            return Err(crate::ConfigError::Validation(
                "worker.backends cannot be empty".to_string(),
            ));
        }
        for backend in &self.backends {
            ValidationUtils::validate_url(backend, "worker.backends")?;
        }

        if self.offliners.is_empty() {
            return Err(crate::ConfigError::Validation(
                "worker.offliners cannot be empty".to_string(),
            ));
        }
        for offliner in &self.offliners {
            ValidationUtils::validate_not_empty(offliner, "worker.offliners")?;
        }
        for context in &self.contexts {
            ValidationUtils::validate_not_empty(&context.name, "worker.contexts.name")?;
        }

        if self.cpu == 0 || self.memory == 0 || self.disk == 0 {
            return Err(crate::ConfigError::Validation(
                "worker.cpu, worker.memory and worker.disk must be greater than 0".to_string(),
            ));
        }

        ValidationUtils::validate_interval_seconds(
            self.poll_interval_seconds,
            "worker.poll_interval_seconds",
        )?;
        ValidationUtils::validate_interval_seconds(
            self.check_in_interval_seconds,
            "worker.check_in_interval_seconds",
        )?;
        ValidationUtils::validate_interval_seconds(
            self.stop_grace_seconds,
            "worker.stop_grace_seconds",
        )?;
        ValidationUtils::validate_count(
            self.request_retries as usize,
            "worker.request_retries",
            20,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_config_validation() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.default_duration_seconds = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config;
        invalid_config.platforms.insert(
            "youtube".to_string(),
            PlatformLimitsConfig {
                global_max: Some(0),
                per_worker_default: None,
            },
        );
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_worker_config_validation() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.name = "".to_string();
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.backends = vec![];
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.backends = vec!["localhost:8000".to_string()];
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.offliners = vec![];
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config;
        invalid_config.cpu = 0;
        assert!(invalid_config.validate().is_err());
    }
}
