//! 资源台账
//!
//! 不保存状态，每次从存活的 task_worker / scraper 容器的资源标签重新计算。
//! 统计的是启动时声明的预留，不是实时用量。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use zimfarm_core::SchedulerResult;
use zimfarm_domain::Resources;
use zimfarm_infrastructure::{
    ContainerInfo, ContainerRuntime, LABEL_CPU, LABEL_DISK, LABEL_MEMORY, LABEL_ROLE,
    LABEL_TASK_ID,
};

use crate::roles::ContainerRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub total: Resources,
    pub used: Resources,
    pub available: Resources,
}

/// 从标签中读出 (task_id, 预留资源)；标签不全时返回 None
pub fn reservation(info: &ContainerInfo) -> Option<(String, Resources)> {
    let task_id = info.label(LABEL_TASK_ID)?.to_string();
    let cpu = info.label(LABEL_CPU)?.parse().ok()?;
    let memory = info.label(LABEL_MEMORY)?.parse().ok()?;
    let disk = info.label(LABEL_DISK)?.parse().ok()?;
    Some((task_id, Resources::new(cpu, memory, disk)))
}

/// 同一任务的 task_worker 与 scraper 只计一次
pub fn summarize(total: Resources, containers: &[ContainerInfo]) -> ResourceUsage {
    let mut per_task: HashMap<String, Resources> = HashMap::new();
    for info in containers.iter().filter(|c| c.state.is_running()) {
        match reservation(info) {
            Some((task_id, resources)) => {
                per_task.entry(task_id).or_insert(resources);
            }
            None => warn!(container = %info.name, "容器缺少资源标签，不计入台账"),
        }
    }

    let used = per_task
        .into_values()
        .fold(Resources::zero(), |acc, r| acc + r);
    ResourceUsage {
        total,
        used,
        available: total.saturating_sub(&used),
    }
}

pub struct ResourceLedger {
    runtime: Arc<dyn ContainerRuntime>,
    total: Resources,
}

impl ResourceLedger {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, total: Resources) -> Self {
        Self { runtime, total }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub async fn compute(&self) -> SchedulerResult<ResourceUsage> {
        let mut containers = Vec::new();
        for role in [ContainerRole::TASK_WORKER, ContainerRole::SCRAPER] {
            containers.extend(self.runtime.list(&[(LABEL_ROLE, role)]).await?);
        }
        Ok(summarize(self.total, &containers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use zimfarm_infrastructure::ContainerState;

    fn container(task_id: Uuid, role: ContainerRole, r: Resources, state: ContainerState) -> ContainerInfo {
        let mut labels: BTreeMap<String, String> = role.labels(task_id);
        labels.extend(crate::roles::resource_labels(&r));
        ContainerInfo {
            id: format!("id-{}", role.as_str()),
            name: role.container_name(task_id),
            image: "img".into(),
            labels,
            state,
            ip_address: None,
        }
    }

    #[test]
    fn test_summarize_dedups_and_clamps() {
        let total = Resources::new(3, 100, 100);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let containers = vec![
            container(a, ContainerRole::TaskWorker, Resources::new(2, 40, 40), ContainerState::Running),
            container(a, ContainerRole::Scraper, Resources::new(2, 40, 40), ContainerState::Running),
            container(b, ContainerRole::TaskWorker, Resources::new(2, 70, 10), ContainerState::Running),
        ];
        let usage = summarize(total, &containers);
        assert_eq!(usage.used, Resources::new(4, 110, 50));
        assert_eq!(usage.available, Resources::new(0, 0, 50));
    }

    #[test]
    fn test_exited_containers_release_resources() {
        let total = Resources::new(3, 100, 100);
        let containers = vec![container(
            Uuid::new_v4(),
            ContainerRole::TaskWorker,
            Resources::new(2, 40, 40),
            ContainerState::Exited(0),
        )];
        assert_eq!(summarize(total, &containers).available, total);
    }
}
