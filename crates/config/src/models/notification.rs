use std::collections::HashMap;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 任务状态通知配置：状态码 → webhook 地址列表
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhooks: HashMap<String, Vec<String>>,
    pub timeout_seconds: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhooks: HashMap::new(),
            timeout_seconds: 10,
        }
    }
}

impl ConfigValidator for NotificationConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_seconds(
            self.timeout_seconds,
            "notifications.timeout_seconds",
        )?;
        for (code, urls) in &self.webhooks {
            ValidationUtils::validate_not_empty(code, "notifications.webhooks")?;
            for url in urls {
                ValidationUtils::validate_url(url, "notifications.webhooks")?;
            }
        }
        Ok(())
    }
}
