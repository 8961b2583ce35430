//! Test data builders for creating test entities
//!
//! 默认值足够小，能放进任何测试Worker；需要的字段再单独覆盖。

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use zimfarm_domain::{
    ImageRef, RequestedTask, Resources, Task, TaskConfig, TaskStatus, Worker,
};

/// Builder for creating test Worker entities
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            worker: Worker::new(name, Resources::new(1, 1, 1), Vec::new()),
        }
    }

    pub fn resources(mut self, cpu: u32, memory: u64, disk: u64) -> Self {
        self.worker.resources = Resources::new(cpu, memory, disk);
        self
    }

    pub fn offliners(mut self, offliners: &[&str]) -> Self {
        self.worker.offliners = offliners.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn selfish(mut self) -> Self {
        self.worker.selfish = true;
        self
    }

    pub fn cordoned(mut self) -> Self {
        self.worker.cordoned = true;
        self
    }

    pub fn admin_disabled(mut self) -> Self {
        self.worker.admin_disabled = true;
        self
    }

    pub fn context(mut self, name: &str, ip: Option<IpAddr>) -> Self {
        self.worker.contexts.insert(name.to_string(), ip);
        self
    }

    pub fn last_ip(mut self, ip: IpAddr) -> Self {
        self.worker.last_ip = Some(ip);
        self
    }

    pub fn platform_override(mut self, platform: &str, max: u32) -> Self {
        self.worker.platform_overrides.insert(platform.to_string(), max);
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

pub fn test_config(offliner: &str) -> TaskConfig {
    TaskConfig::new(
        offliner,
        ImageRef::new(format!("ghcr.io/openzim/{offliner}"), "dev"),
        Resources::new(1, 1, 1),
    )
}

/// Builder for creating test RequestedTask entities
pub struct RequestedTaskBuilder {
    task: RequestedTask,
}

impl RequestedTaskBuilder {
    pub fn new(offliner: &str) -> Self {
        Self {
            task: RequestedTask::new(None, test_config(offliner), 0),
        }
    }

    pub fn schedule(mut self, name: &str) -> Self {
        self.task.schedule_name = Some(name.to_string());
        self
    }

    pub fn resources(mut self, cpu: u32, memory: u64, disk: u64) -> Self {
        self.task.config.resources = Resources::new(cpu, memory, disk);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn worker(mut self, name: &str) -> Self {
        self.task.worker_name = Some(name.to_string());
        self
    }

    pub fn context(mut self, context: &str) -> Self {
        self.task.context = context.to_string();
        self
    }

    pub fn platform(mut self, platform: &str) -> Self {
        self.task.config.platform = Some(platform.to_string());
        self
    }

    pub fn command(mut self, command: &[&str]) -> Self {
        self.task.config.command = command.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn config(mut self, config: TaskConfig) -> Self {
        self.task.config = config;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        if let Some(event) = self.task.events.first_mut() {
            event.timestamp = at;
        }
        self.task.timestamps.insert(TaskStatus::Requested, at);
        self
    }

    pub fn build(self) -> RequestedTask {
        self.task
    }
}

/// Builder for creating test Task entities
pub struct TaskBuilder {
    requested: RequestedTaskBuilder,
    worker_name: String,
    status: Option<TaskStatus>,
    started_at: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new(offliner: &str) -> Self {
        Self {
            requested: RequestedTaskBuilder::new(offliner),
            worker_name: "worker".to_string(),
            status: None,
            started_at: None,
        }
    }

    pub fn worker(mut self, name: &str) -> Self {
        self.worker_name = name.to_string();
        self
    }

    pub fn schedule(mut self, name: &str) -> Self {
        self.requested = self.requested.schedule(name);
        self
    }

    pub fn resources(mut self, cpu: u32, memory: u64, disk: u64) -> Self {
        self.requested = self.requested.resources(cpu, memory, disk);
        self
    }

    pub fn config(mut self, config: TaskConfig) -> Self {
        self.requested = self.requested.config(config);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn build(self) -> Task {
        let mut task = Task::from_requested(self.requested.build(), self.worker_name);
        if let Some(at) = self.started_at {
            task.timestamps.insert(TaskStatus::Started, at);
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        task
    }
}
