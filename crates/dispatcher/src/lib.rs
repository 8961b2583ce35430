//! 调度端
//!
//! 任务匹配、事件管道、历史时长聚合，以及对外的调度服务。

pub mod durations;
pub mod event_pipeline;
pub mod local_backend;
pub mod matcher;
pub mod metrics;
pub mod service;

pub use durations::*;
pub use event_pipeline::*;
pub use local_backend::*;
pub use matcher::*;
pub use service::*;

use zimfarm_config::DispatcherConfig;
use zimfarm_domain::{PlatformLimits, PlatformPolicy};

/// 由配置构造只读的平台并发策略
pub fn policy_from_config(config: &DispatcherConfig) -> PlatformPolicy {
    let limits = config
        .platforms
        .iter()
        .map(|(platform, limits)| {
            (
                platform.clone(),
                PlatformLimits {
                    global_max: limits.global_max,
                    per_worker_default: limits.per_worker_default,
                },
            )
        })
        .collect();
    PlatformPolicy::new(limits, config.offliner_platforms.clone())
}
