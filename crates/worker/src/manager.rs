//! Worker Fleet Manager
//!
//! 每台主机一个控制循环。每轮：对账 task_worker 容器 → 检查取消标记 →
//! 计算资源台账 → 轮转向后端请求任务并领取 → 为领取到的任务启动执行器容器。
//! 执行器彼此独立，管理器只观察它们的容器。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zimfarm_config::{AppConfig, ExecutorConfig, ObservabilityConfig, WorkerConfig};
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{
    Backend, CheckIn, ClaimOutcome, EventPayload, EventReport, OfferRequest, Resources, Task,
    TaskStatus,
};
use zimfarm_infrastructure::{ContainerRuntime, ContainerSpec, Mount, LABEL_ROLE, LABEL_TASK_ID};

use crate::ledger::ResourceLedger;
use crate::roles::ContainerRole;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const EXECUTOR_CONFIG_FILE: &str = "executor.toml";

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub worker: WorkerConfig,
    /// 原样写入每个执行器的配置文件
    pub executor: ExecutorConfig,
    pub observability: ObservabilityConfig,
}

impl FleetSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            executor: config.executor.clone(),
            observability: config.observability.clone(),
        }
    }

    pub fn total(&self) -> Resources {
        Resources::new(self.worker.cpu, self.worker.memory, self.worker.disk)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_seconds)
    }

    pub fn check_in_interval(&self) -> Duration {
        Duration::from_secs(self.worker.check_in_interval_seconds)
    }

    pub fn claim_cooldown(&self) -> Duration {
        Duration::from_secs(self.worker.claim_cooldown_seconds)
    }

    /// 停止执行器容器的宽限期：执行器完整的取消流程再加余量
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.executor.cancel_budget_seconds() + self.worker.stop_grace_seconds)
    }

    /// 清理执行器遗留子容器时的宽限期
    pub fn sidecar_stop_grace(&self) -> Duration {
        Duration::from_secs(self.executor.stop_grace_seconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct WatchedTask {
    container_name: String,
    /// 领取该任务的后端；重启后恢复的任务未知
    backend: Option<usize>,
    cancel_sent: bool,
}

pub struct FleetManager {
    settings: FleetSettings,
    backends: Vec<Arc<dyn Backend>>,
    next_backend: AtomicUsize,
    runtime: Arc<dyn ContainerRuntime>,
    ledger: ResourceLedger,
    watched: HashMap<Uuid, WatchedTask>,
    /// 后台进行中的执行器停止
    stopping: HashMap<Uuid, JoinHandle<SchedulerResult<()>>>,
}

impl FleetManager {
    pub fn new(
        settings: FleetSettings,
        backends: Vec<Arc<dyn Backend>>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> SchedulerResult<Self> {
        if backends.is_empty() {
            return Err(SchedulerError::Configuration(
                "至少需要配置一个调度后端".to_string(),
            ));
        }
        let ledger = ResourceLedger::new(runtime.clone(), settings.total());
        Ok(Self {
            settings,
            backends,
            next_backend: AtomicUsize::new(0),
            runtime,
            ledger,
            watched: HashMap::new(),
            stopping: HashMap::new(),
        })
    }

    pub fn worker_name(&self) -> &str {
        &self.settings.worker.name
    }

    /// 当前观察中的任务id
    pub fn watched_tasks(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.watched.keys().copied().collect();
        ids.sort();
        ids
    }

    fn next_backend(&self) -> (usize, Arc<dyn Backend>) {
        let index = self.next_backend.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        (index, self.backends[index].clone())
    }

    /// 向每个后端上报静态容量和能力
    pub async fn check_in(&self) {
        let worker = &self.settings.worker;
        let check_in = CheckIn {
            worker_name: worker.name.clone(),
            resources: self.settings.total(),
            offliners: worker.offliners.clone(),
            platform_overrides: worker.platform_overrides.clone(),
            cordoned: worker.cordoned,
            selfish: worker.selfish,
            contexts: worker.context_map(),
        };
        for backend in &self.backends {
            match backend.check_in(&check_in).await {
                Ok(()) => debug!(backend = backend.name(), worker = %worker.name, "check-in完成"),
                Err(e) => warn!(backend = backend.name(), worker = %worker.name, "check-in失败: {}", e),
            }
        }
    }

    /// 一轮轮询；领取并启动了新任务时返回其id
    pub async fn poll_once(&mut self) -> SchedulerResult<Option<Uuid>> {
        self.reconcile().await?;
        self.check_cancellations().await;

        if self.settings.worker.cordoned {
            debug!(worker = %self.worker_name(), "Worker已隔离，不请求新任务");
            return Ok(None);
        }

        let usage = self.ledger.compute().await?;
        let (index, backend) = self.next_backend();
        let request = OfferRequest {
            worker_name: self.settings.worker.name.clone(),
            available: usage.available,
            source_ip: None,
        };
        let Some(offered) = backend.offer(&request).await? else {
            debug!(
                backend = backend.name(),
                available_cpu = usage.available.cpu,
                available_memory = usage.available.memory,
                "没有可分配的任务"
            );
            return Ok(None);
        };

        let outcome = match backend.claim(offered.id, &self.settings.worker.name).await {
            Ok(outcome) => outcome,
            Err(SchedulerError::Conflict(reason)) => {
                warn!(task_id = %offered.id, backend = backend.name(), "领取被拒绝: {}", reason);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match outcome {
            ClaimOutcome::Claimed(task) => {
                info!(
                    task_id = %task.id,
                    schedule = task.schedule_display_name(),
                    backend = backend.name(),
                    "已领取任务"
                );
                self.launch(&task, index, backend.name()).await?;
                Ok(Some(task.id))
            }
            ClaimOutcome::AlreadyClaimed => {
                debug!(task_id = %offered.id, "任务已被其他Worker领取");
                Ok(None)
            }
        }
    }

    /// 按实际存在的 task_worker 容器修正观察列表
    ///
    /// 执行器退出或容器消失而任务仍未结束时，由管理器补报终态并清理遗留子容器。
    async fn reconcile(&mut self) -> SchedulerResult<()> {
        let containers = self
            .runtime
            .list(&[(LABEL_ROLE, ContainerRole::TASK_WORKER)])
            .await?;

        let mut alive = Vec::new();
        let mut ended: Vec<(Uuid, Option<usize>, String)> = Vec::new();
        for info in containers {
            let Some(task_id) = info.label(LABEL_TASK_ID).and_then(|id| id.parse::<Uuid>().ok())
            else {
                warn!(container = %info.name, "task_worker容器缺少task_id标签");
                continue;
            };
            if let Some(code) = info.state.exit_code() {
                info!(%task_id, exit_code = code, "执行器已结束");
                if let Err(e) = self.runtime.remove(&info.name).await {
                    warn!(container = %info.name, "删除执行器容器失败: {}", e);
                }
                let backend = self.watched.remove(&task_id).and_then(|w| w.backend);
                ended.push((task_id, backend, format!("执行器退出码为{code}，任务未结束")));
                continue;
            }
            alive.push(task_id);
            self.watched.entry(task_id).or_insert_with(|| {
                info!(%task_id, container = %info.name, "恢复观察运行中的执行器");
                WatchedTask {
                    container_name: info.name.clone(),
                    backend: None,
                    cancel_sent: false,
                }
            });
        }

        let vanished: Vec<Uuid> = self
            .watched
            .keys()
            .filter(|id| !alive.contains(id))
            .copied()
            .collect();
        for task_id in vanished {
            if let Some(watched) = self.watched.remove(&task_id) {
                warn!(%task_id, container = %watched.container_name, "执行器容器已消失");
                ended.push((task_id, watched.backend, "执行器容器已消失，任务未结束".to_string()));
            }
        }

        for (task_id, backend, reason) in ended {
            self.finalize(task_id, backend, &reason).await;
        }
        Ok(())
    }

    /// 为失去执行器的任务补报终态：已标记取消的报 Canceled，否则报 Failed
    async fn finalize(&mut self, task_id: Uuid, backend: Option<usize>, reason: &str) {
        if let Some(handle) = self.stopping.remove(&task_id) {
            handle.abort();
        }
        if let Some((backend, task)) = self.locate_task(task_id, backend).await {
            if !task.is_terminal() {
                let report = if task.is_cancel_marked() {
                    EventReport::new(TaskStatus::Canceled).with_payload(EventPayload {
                        canceled_by: task.canceled_by.clone(),
                        ..Default::default()
                    })
                } else {
                    EventReport::new(TaskStatus::Failed).with_payload(EventPayload {
                        exception: Some(reason.to_string()),
                        ..Default::default()
                    })
                };
                warn!(%task_id, code = %report.code, "{}", reason);
                if let Err(e) = backend.report_event(task_id, &report).await {
                    warn!(%task_id, backend = backend.name(), "补报终态失败: {}", e);
                }
            }
        }
        self.remove_leftovers(task_id).await;
    }

    async fn remove_leftovers(&self, task_id: Uuid) {
        let id = task_id.to_string();
        let leftovers = match self.runtime.list(&[(LABEL_TASK_ID, id.as_str())]).await {
            Ok(leftovers) => leftovers,
            Err(e) => {
                warn!(%task_id, "列出遗留容器失败: {}", e);
                return;
            }
        };
        for info in leftovers {
            if info.state.is_running() {
                if let Err(e) = self.runtime.stop(&info.name, self.settings.sidecar_stop_grace()).await {
                    warn!(container = %info.name, "停止遗留容器失败: {}", e);
                }
            }
            match self.runtime.remove(&info.name).await {
                Ok(()) => debug!(%task_id, container = %info.name, "已清理遗留容器"),
                Err(e) => warn!(container = %info.name, "删除遗留容器失败: {}", e),
            }
        }
    }

    async fn locate_task(
        &self,
        task_id: Uuid,
        backend: Option<usize>,
    ) -> Option<(Arc<dyn Backend>, Task)> {
        let candidates: Vec<&Arc<dyn Backend>> = match backend {
            Some(index) => self.backends.get(index).into_iter().collect(),
            None => self.backends.iter().collect(),
        };
        for backend in candidates {
            match backend.get_job(task_id).await {
                Ok(task) => return Some((backend.clone(), task)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => warn!(%task_id, backend = backend.name(), "查询任务失败: {}", e),
            }
        }
        None
    }

    /// 回收已完成的后台停止；失败的允许下一轮重试
    async fn collect_stops(&mut self) {
        let finished: Vec<Uuid> = self
            .stopping
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for task_id in finished {
            let Some(handle) = self.stopping.remove(&task_id) else {
                continue;
            };
            let failed = match handle.await {
                Ok(Ok(())) => {
                    debug!(%task_id, "执行器容器已停止");
                    false
                }
                Ok(Err(e)) => {
                    warn!(%task_id, "停止执行器容器失败: {}", e);
                    true
                }
                Err(e) => {
                    warn!(%task_id, "停止执行器容器的任务异常: {}", e);
                    true
                }
            };
            if failed {
                if let Some(watched) = self.watched.get_mut(&task_id) {
                    watched.cancel_sent = false;
                }
            }
        }
    }

    /// 带取消标记的任务：在后台优雅停止其执行器容器，执行器走取消流程
    ///
    /// 停止要等执行器的整个取消流程，不能阻塞轮询。
    async fn check_cancellations(&mut self) {
        self.collect_stops().await;
        let pending: Vec<(Uuid, Option<usize>)> = self
            .watched
            .iter()
            .filter(|(_, watched)| !watched.cancel_sent)
            .map(|(id, watched)| (*id, watched.backend))
            .collect();

        for (task_id, backend) in pending {
            let Some((_, task)) = self.locate_task(task_id, backend).await else {
                continue;
            };
            if !task.is_cancel_marked() {
                continue;
            }
            let Some(watched) = self.watched.get_mut(&task_id) else {
                continue;
            };
            info!(%task_id, canceled_by = ?task.canceled_by, "任务已被取消，停止执行器");
            watched.cancel_sent = true;
            let runtime = self.runtime.clone();
            let container = watched.container_name.clone();
            let grace = self.settings.stop_grace();
            self.stopping.insert(
                task_id,
                tokio::spawn(async move { runtime.stop(&container, grace).await }),
            );
        }
    }

    fn executor_config(&self, backend_url: &str) -> AppConfig {
        let mut worker = self.settings.worker.clone();
        worker.backends = vec![backend_url.to_string()];
        AppConfig {
            worker,
            executor: self.settings.executor.clone(),
            observability: self.settings.observability.clone(),
            ..Default::default()
        }
    }

    /// 写入执行器配置并启动 task_worker 容器
    async fn launch(&mut self, task: &Task, backend: usize, backend_url: &str) -> SchedulerResult<()> {
        let workdir = PathBuf::from(&self.settings.worker.workdir);
        let task_dir = workdir.join(task.id.to_string());
        tokio::fs::create_dir_all(&task_dir).await?;

        let config = toml::to_string(&self.executor_config(backend_url))
            .map_err(|e| SchedulerError::Serialization(format!("序列化执行器配置失败: {e}")))?;
        let config_path = task_dir.join(EXECUTOR_CONFIG_FILE);
        tokio::fs::write(&config_path, config).await?;

        let spec = self.task_worker_spec(task, &config_path.to_string_lossy());
        if let Err(e) = self.runtime.run(&spec).await {
            error!(task_id = %task.id, "启动执行器容器失败: {}", e);
            return Err(e);
        }
        info!(task_id = %task.id, container = %spec.name, "执行器已启动");
        self.watched.insert(
            task.id,
            WatchedTask {
                container_name: spec.name,
                backend: Some(backend),
                cancel_sent: false,
            },
        );
        Ok(())
    }

    fn task_worker_spec(&self, task: &Task, config_path: &str) -> ContainerSpec {
        let role = ContainerRole::TaskWorker;
        let workdir = &self.settings.worker.workdir;
        let command = [
            "zimfarm",
            "--config",
            config_path,
            "task-executor",
            "--task-id",
            &task.id.to_string(),
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        let mut spec = ContainerSpec::new(
            role.container_name(task.id),
            self.settings.worker.task_worker_image.clone(),
        )
        .with_command(command)
        .with_mount(Mount::bind(workdir.as_str(), workdir.as_str()))
        .with_mount(Mount::bind(DOCKER_SOCKET, DOCKER_SOCKET))
        .with_env("ZIMFARM__WORKER__NAME", self.settings.worker.name.clone());
        spec.labels = role.reservation_labels(task.id, &task.config);
        spec
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            worker = %self.worker_name(),
            backends = self.backends.len(),
            "Fleet Manager启动"
        );

        let mut poll_ticker = interval(self.settings.poll_interval());
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check_in_ticker = interval(self.settings.check_in_interval());
        check_in_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = check_in_ticker.tick() => {
                    self.check_in().await;
                }
                _ = poll_ticker.tick() => {
                    match self.poll_once().await {
                        Ok(Some(_)) => {
                            // 等新任务的资源标签生效后再继续请求
                            tokio::select! {
                                _ = tokio::time::sleep(self.settings.claim_cooldown()) => {}
                                _ = shutdown.recv() => break,
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_retryable() => warn!("本轮轮询失败: {}", e),
                        Err(e) => error!("本轮轮询失败: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!(worker = %self.worker_name(), watched = self.watched.len(), "Fleet Manager停止，执行器容器继续运行");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zimfarm_testing_utils::{FakeContainerRuntime, RecordingBackend};

    fn settings() -> FleetSettings {
        let mut config = AppConfig::default();
        config.worker.name = "w1".to_string();
        config.worker.workdir = "/srv/zimfarm".to_string();
        FleetSettings::from_config(&config)
    }

    #[test]
    fn test_round_robin_backends() {
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(RecordingBackend::new("a")),
            Arc::new(RecordingBackend::new("b")),
        ];
        let manager =
            FleetManager::new(settings(), backends, Arc::new(FakeContainerRuntime::new())).unwrap();
        let names: Vec<String> = (0..4)
            .map(|_| manager.next_backend().1.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_requires_a_backend() {
        let result = FleetManager::new(settings(), Vec::new(), Arc::new(FakeContainerRuntime::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_executor_config_targets_claiming_backend() {
        let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(RecordingBackend::new("a"))];
        let manager =
            FleetManager::new(settings(), backends, Arc::new(FakeContainerRuntime::new())).unwrap();
        let config = manager.executor_config("http://dispatcher:8000");
        assert_eq!(config.worker.backends, vec!["http://dispatcher:8000".to_string()]);
        assert_eq!(config.worker.name, "w1");

        let text = toml::to_string(&config).unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.executor.max_attempts, config.executor.max_attempts);
    }
}
