use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zimfarm_config::NotificationConfig;
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{IpChangeListener, Notifier, Task, TaskStatus, Worker};

#[derive(Debug, Serialize, PartialEq)]
pub struct WebhookPayload<'a> {
    pub task_id: Uuid,
    pub code: TaskStatus,
    pub status: TaskStatus,
    pub schedule_name: &'a str,
    pub worker: &'a str,
}

/// 按状态码向配置的地址POST任务摘要；失败只记录日志
pub struct WebhookNotifier {
    webhooks: HashMap<TaskStatus, Vec<String>>,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> SchedulerResult<Self> {
        let mut webhooks = HashMap::new();
        for (code, urls) in &config.webhooks {
            let code: TaskStatus = code.parse()?;
            webhooks.insert(code, urls.clone());
        }
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            webhooks,
            http_client,
        })
    }

    pub fn targets(&self, code: TaskStatus) -> &[String] {
        self.webhooks.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, task: &Task, code: TaskStatus) {
        let targets = self.targets(code);
        if targets.is_empty() {
            return;
        }

        let payload = WebhookPayload {
            task_id: task.id,
            code,
            status: task.status,
            schedule_name: task.schedule_display_name(),
            worker: &task.worker_name,
        };

        for url in targets {
            match self.http_client.post(url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(task_id = %task.id, %code, url = %url, "通知已发送");
                }
                Ok(response) => {
                    warn!(task_id = %task.id, %code, url = %url, "通知失败: HTTP {}", response.status());
                }
                Err(e) => {
                    warn!(task_id = %task.id, %code, url = %url, "通知失败: {}", e);
                }
            }
        }
    }
}

/// 默认的IP变化处理：只记录日志
pub struct LoggingIpChangeListener;

#[async_trait]
impl IpChangeListener for LoggingIpChangeListener {
    async fn on_ip_changed(&self, worker: &Worker, previous: Option<IpAddr>, current: IpAddr) {
        info!(
            worker = %worker.name,
            previous = ?previous,
            current = %current,
            "Worker来源IP已变化"
        );
    }
}
