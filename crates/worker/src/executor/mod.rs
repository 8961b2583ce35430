//! Task Executor
//!
//! 每个任务一个执行器，独占该任务的全部容器：
//! 1. 启动 dnscache，再启动 scraper（及可选的 monitor），按固定间隔上报日志、统计和进度；
//! 2. scraper 退出后写出完整日志，发现产出文件，并行推进日志上传、附件上传，
//!    以及每个文件的检查 → 上传；
//! 3. 全部步骤有结果后上报终态并清理容器。
//!
//! 收到取消信号时停止抓取，限时刷出日志和附件上传，上报 `canceled` 后再清理容器。

pub mod specs;
pub mod stats;
pub mod steps;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zimfarm_config::{ExecutorConfig, WorkerConfig};
use zimfarm_core::SchedulerResult;
use zimfarm_domain::{
    Backend, EventPayload, EventReport, FilePayload, FileStatus, Task, TaskStatus,
};
use zimfarm_infrastructure::{ContainerInfo, ContainerLogs, ContainerRuntime, ContainerSpec};

use crate::roles::ContainerRole;
use specs::SpecFactory;
use stats::{dir_size, read_progress, tail_lines, StatsTracker};
use steps::{FileSteps, Step, StepState, Transition};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub worker_name: String,
    pub workdir: PathBuf,
    pub tick: Duration,
    pub dnscache_image: String,
    pub monitor_image: Option<String>,
    pub uploader_image: String,
    pub checker_image: String,
    pub max_attempts: u32,
    pub cpu_smoothing: f64,
    pub cancel_flush_timeout: Duration,
    pub progress_file: String,
    pub log_tail_lines: usize,
    pub stop_grace: Duration,
}

impl ExecutorSettings {
    pub fn from_config(worker: &WorkerConfig, executor: &ExecutorConfig) -> Self {
        Self {
            worker_name: worker.name.clone(),
            workdir: PathBuf::from(&worker.workdir),
            tick: Duration::from_secs(executor.report_interval_seconds),
            dnscache_image: executor.dnscache_image.clone(),
            monitor_image: executor.monitor_image.clone(),
            uploader_image: executor.uploader_image.clone(),
            checker_image: executor.checker_image.clone(),
            max_attempts: executor.max_attempts,
            cpu_smoothing: executor.cpu_smoothing,
            cancel_flush_timeout: Duration::from_secs(executor.cancel_flush_timeout_seconds),
            progress_file: executor.progress_file.clone(),
            log_tail_lines: executor.log_tail_lines,
            stop_grace: Duration::from_secs(executor.stop_grace_seconds),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &ExecutorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorOutcome {
    Succeeded,
    Failed,
    Canceled,
}

/// 容器退出码的含义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitPolicy {
    /// 非零退出码算一次失败
    ZeroIsSuccess,
    /// 退出码本身就是结果（检查器）
    CodeIsResult,
}

/// 本任务启动的容器，按角色索引
struct Arena {
    runtime: Arc<dyn ContainerRuntime>,
    handles: BTreeMap<ContainerRole, String>,
    stop_grace: Duration,
    max_attempts: u32,
    tail: usize,
}

impl Arena {
    async fn start(&mut self, role: ContainerRole, spec: &ContainerSpec) -> SchedulerResult<()> {
        // 上一次尝试留下的同名容器
        self.release(&role).await;
        self.runtime.run(spec).await?;
        debug!(container = %spec.name, image = %spec.image, "容器已启动");
        self.handles.insert(role, spec.name.clone());
        Ok(())
    }

    async fn inspect(&self, role: &ContainerRole) -> SchedulerResult<Option<ContainerInfo>> {
        match self.handles.get(role) {
            Some(name) => self.runtime.inspect(name).await,
            None => Ok(None),
        }
    }

    async fn stop(&self, role: &ContainerRole) {
        if let Some(name) = self.handles.get(role) {
            if let Err(e) = self.runtime.stop(name, self.stop_grace).await {
                warn!(container = %name, "停止容器失败: {}", e);
            }
        }
    }

    async fn release(&mut self, role: &ContainerRole) {
        if let Some(name) = self.handles.remove(role) {
            if let Err(e) = self.runtime.remove(&name).await {
                warn!(container = %name, "删除容器失败: {}", e);
            }
        }
    }

    /// 并行停止仍在运行的容器后全部删除，耗时不超过一个停止宽限期
    async fn teardown(&mut self) {
        let mut stops = JoinSet::new();
        for name in self.handles.values() {
            let Ok(Some(info)) = self.runtime.inspect(name).await else {
                continue;
            };
            if !info.state.is_running() {
                continue;
            }
            let runtime = self.runtime.clone();
            let name = name.clone();
            let grace = self.stop_grace;
            stops.spawn(async move {
                if let Err(e) = runtime.stop(&name, grace).await {
                    warn!(container = %name, "停止容器失败: {}", e);
                }
            });
        }
        while stops.join_next().await.is_some() {}

        let roles: Vec<ContainerRole> = self.handles.keys().cloned().collect();
        for role in roles {
            self.release(&role).await;
        }
    }

    fn fail(&self, step: &mut Step) -> Transition {
        if step.record_failure(self.max_attempts) {
            Transition::Exhausted
        } else {
            Transition::Retrying
        }
    }

    /// 推进一个步骤：待启动的启动，运行中的检查是否已退出
    async fn advance<F>(&mut self, step: &mut Step, policy: ExitPolicy, spec: F) -> Transition
    where
        F: FnOnce() -> ContainerSpec,
    {
        match step.state {
            StepState::Pending => match self.start(step.role.clone(), &spec()).await {
                Ok(()) => {
                    step.state = StepState::Doing;
                    Transition::Started
                }
                Err(e) => {
                    warn!(role = step.role.as_str(), attempt = step.attempts + 1, "启动容器失败: {}", e);
                    self.fail(step)
                }
            },
            StepState::Doing => match self.inspect(&step.role).await {
                Ok(Some(info)) => {
                    let Some(exit_code) = info.state.exit_code() else {
                        return Transition::None;
                    };
                    let output = self
                        .runtime
                        .logs(&info.name, Some(self.tail))
                        .await
                        .ok()
                        .map(|logs| logs.stdout);
                    self.release(&step.role).await;
                    if policy == ExitPolicy::ZeroIsSuccess && exit_code != 0 {
                        warn!(role = step.role.as_str(), exit_code, attempt = step.attempts + 1, "容器以非零退出码结束");
                        return self.fail(step);
                    }
                    step.state = StepState::Done;
                    Transition::Done { exit_code, output }
                }
                Ok(None) => {
                    warn!(role = step.role.as_str(), "容器已消失");
                    self.handles.remove(&step.role);
                    self.fail(step)
                }
                Err(e) => {
                    debug!(role = step.role.as_str(), "查询容器失败，下一轮再试: {}", e);
                    Transition::None
                }
            },
            _ => Transition::None,
        }
    }
}

/// scraper 退出之后的上传阶段
struct Uploads {
    log: Step,
    artifacts: Step,
    files: Vec<FileSteps>,
}

impl Uploads {
    fn new(task: &Task) -> Self {
        let upload = &task.config.upload;
        Self {
            log: Step::new(ContainerRole::LogUploader, upload.logs.is_some()),
            artifacts: Step::new(
                ContainerRole::ArtifactsUploader,
                upload.artifacts.is_some() && !task.config.artifacts_globs.is_empty(),
            ),
            files: Vec::new(),
        }
    }

    fn is_resolved(&self) -> bool {
        self.log.state.is_resolved()
            && self.artifacts.state.is_resolved()
            && self.files.iter().all(FileSteps::is_resolved)
    }
}

async fn cancellation(shutdown: &mut broadcast::Receiver<()>) {
    if let Err(broadcast::error::RecvError::Closed) = shutdown.recv().await {
        // 发送端已经关闭，不会再有取消信号
        std::future::pending::<()>().await;
    }
}

/// 任务目录顶层的 `*.zim`，按名字排序
fn discover_zims(dir: &Path) -> Vec<(String, Option<u64>)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(String, Option<u64>)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if !name.ends_with(".zim") {
                return None;
            }
            let size = entry.metadata().ok().map(|meta| meta.len());
            Some((name, size))
        })
        .collect();
    files.sort();
    files
}

fn file_payload(name: &str, apply: impl FnOnce(&mut FilePayload)) -> EventPayload {
    let mut file = FilePayload::named(name);
    apply(&mut file);
    EventPayload {
        file: Some(file),
        ..Default::default()
    }
}

pub struct TaskExecutor {
    task_id: Uuid,
    backend: Arc<dyn Backend>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: ExecutorSettings,
    arena: Arena,
    stats: StatsTracker,
    last_logs: ContainerLogs,
}

impl TaskExecutor {
    pub fn new(
        task_id: Uuid,
        backend: Arc<dyn Backend>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ExecutorSettings,
    ) -> Self {
        let arena = Arena {
            runtime: runtime.clone(),
            handles: BTreeMap::new(),
            stop_grace: settings.stop_grace,
            max_attempts: settings.max_attempts,
            tail: settings.log_tail_lines,
        };
        Self {
            task_id,
            backend,
            runtime,
            stats: StatsTracker::new(settings.cpu_smoothing),
            settings,
            arena,
            last_logs: ContainerLogs::default(),
        }
    }

    fn task_dir(&self) -> PathBuf {
        self.settings.workdir.join(self.task_id.to_string())
    }

    /// 上报失败只记日志，不中断执行
    async fn report(&self, code: TaskStatus, payload: EventPayload) {
        let report = EventReport::new(code).with_payload(payload);
        if let Err(e) = self.backend.report_event(self.task_id, &report).await {
            warn!(task_id = %self.task_id, code = code.as_str(), "上报事件失败: {}", e);
        }
    }

    fn tails(&self) -> EventPayload {
        EventPayload {
            stdout: Some(tail_lines(&self.last_logs.stdout, self.settings.log_tail_lines)),
            stderr: Some(tail_lines(&self.last_logs.stderr, self.settings.log_tail_lines)),
            ..Default::default()
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<ExecutorOutcome> {
        let task = self.backend.get_job(self.task_id).await?;
        let task_dir = self.task_dir();
        if let Err(e) = tokio::fs::create_dir_all(&task_dir).await {
            error!(task_id = %task.id, path = %task_dir.display(), "创建任务目录失败: {}", e);
            let payload = EventPayload {
                exception: Some(format!("创建任务目录失败: {e}")),
                ..Default::default()
            };
            self.report(TaskStatus::Failed, payload).await;
            return Err(e.into());
        }
        info!(task_id = %task.id, offliner = task.offliner(), worker = %self.settings.worker_name, "开始执行任务");
        self.report(TaskStatus::Started, EventPayload::default()).await;

        let task_dir_str = task_dir.to_string_lossy().to_string();
        let dns = self.start_dnscache(&task, &task_dir_str).await;
        if let Err(e) = self.start_scraper(&task, &task_dir_str, dns.as_deref()).await {
            error!(task_id = %task.id, "启动scraper失败: {}", e);
            let payload = EventPayload {
                exception: Some(format!("启动scraper失败: {e}")),
                ..Default::default()
            };
            self.arena.teardown().await;
            self.report(TaskStatus::Failed, payload).await;
            return Ok(ExecutorOutcome::Failed);
        }

        let mut ticker = interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit_code = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancellation(&mut shutdown) => {
                    let uploads = Uploads::new(&task);
                    return self.cancel(&task, &task_dir_str, uploads).await;
                }
            }
            if let Some(code) = self.watch_scraper(&task, &task_dir).await {
                break code;
            }
        };

        self.complete_scraper(&task, &task_dir, exit_code).await;

        let mut uploads = Uploads::new(&task);
        for (name, size) in discover_zims(&task_dir) {
            let upload = &task.config.upload;
            self.report(
                TaskStatus::CreatedFile,
                file_payload(&name, |f| {
                    f.size = size;
                    f.status = Some(FileStatus::Created);
                }),
            )
            .await;
            uploads.files.push(FileSteps::new(
                name,
                size,
                upload.zim.is_some(),
                upload.zimcheck,
                upload.check.is_some(),
            ));
        }

        while !uploads.is_resolved() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancellation(&mut shutdown) => {
                    return self.cancel(&task, &task_dir_str, uploads).await;
                }
            }
            self.advance_uploads(&task, &task_dir_str, &mut uploads).await;
        }

        let failed_files: Vec<&str> = uploads
            .files
            .iter()
            .filter(|f| !f.is_successful())
            .map(|f| f.name.as_str())
            .collect();
        let outcome = if exit_code == 0 && failed_files.is_empty() {
            ExecutorOutcome::Succeeded
        } else {
            ExecutorOutcome::Failed
        };

        self.arena.teardown().await;
        match outcome {
            ExecutorOutcome::Succeeded => {
                info!(task_id = %task.id, files = uploads.files.len(), "任务成功");
                self.report(TaskStatus::Succeeded, EventPayload::default()).await;
            }
            _ => {
                let exception = if exit_code != 0 {
                    format!("scraper退出码为{exit_code}")
                } else {
                    format!("文件处理失败: {}", failed_files.join(", "))
                };
                warn!(task_id = %task.id, %exception, "任务失败");
                let payload = EventPayload {
                    exception: Some(exception),
                    ..self.tails()
                };
                self.report(TaskStatus::Failed, payload).await;
            }
        }
        Ok(outcome)
    }

    async fn start_dnscache(&mut self, task: &Task, task_dir: &str) -> Option<String> {
        let spec = SpecFactory {
            task,
            task_dir,
            settings: &self.settings,
        }
        .dnscache();
        if let Err(e) = self.arena.start(ContainerRole::Dnscache, &spec).await {
            warn!(task_id = %task.id, "启动dnscache失败，使用默认DNS: {}", e);
            return None;
        }
        match self.arena.inspect(&ContainerRole::Dnscache).await {
            Ok(Some(info)) => info.ip_address,
            _ => None,
        }
    }

    async fn start_scraper(&mut self, task: &Task, task_dir: &str, dns: Option<&str>) -> SchedulerResult<()> {
        let spec = SpecFactory {
            task,
            task_dir,
            settings: &self.settings,
        }
        .scraper(dns);
        if let Err(e) = self.runtime.pull_image(&spec.image).await {
            warn!(image = %spec.image, "拉取镜像失败，尝试使用本地镜像: {}", e);
        }
        self.arena.start(ContainerRole::Scraper, &spec).await?;
        let payload = EventPayload {
            image: Some(spec.image.clone()),
            command: Some(spec.command.clone()),
            ..Default::default()
        };
        self.report(TaskStatus::ScraperStarted, payload).await;
        Ok(())
    }

    /// 一轮抓取监控；scraper 已退出时返回其退出码
    async fn watch_scraper(&mut self, task: &Task, task_dir: &Path) -> Option<i32> {
        let info = match self.arena.inspect(&ContainerRole::Scraper).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                error!(task_id = %task.id, "scraper容器已消失");
                return Some(-1);
            }
            Err(e) => {
                debug!(task_id = %task.id, "查询scraper失败，下一轮再试: {}", e);
                return None;
            }
        };
        if let Some(code) = info.state.exit_code() {
            return Some(code);
        }

        if let Some(address) = info.ip_address.as_deref() {
            self.ensure_monitor(task, task_dir, address).await;
        }

        if let Ok(logs) = self
            .runtime
            .logs(&info.name, Some(self.settings.log_tail_lines))
            .await
        {
            self.last_logs = logs;
        }
        let usage = self.runtime.usage(&info.name).await.ok().flatten();
        let stats = self.stats.record(usage, dir_size(task_dir));
        let progress = read_progress(&task_dir.join(&self.settings.progress_file));
        let payload = EventPayload {
            progress,
            stats: Some(stats),
            ..self.tails()
        };
        self.report(TaskStatus::ScraperRunning, payload).await;
        None
    }

    async fn ensure_monitor(&mut self, task: &Task, task_dir: &Path, scraper_address: &str) {
        if !task.config.monitor || self.arena.handles.contains_key(&ContainerRole::Monitor) {
            return;
        }
        let Some(image) = self.settings.monitor_image.clone() else {
            return;
        };
        let task_dir = task_dir.to_string_lossy();
        let spec = SpecFactory {
            task,
            task_dir: &task_dir,
            settings: &self.settings,
        }
        .monitor(&image, scraper_address);
        if let Err(e) = self.arena.start(ContainerRole::Monitor, &spec).await {
            warn!(task_id = %task.id, "启动monitor失败: {}", e);
        }
    }

    /// 写出完整日志并上报 scraper 的最终状态
    async fn complete_scraper(&mut self, task: &Task, task_dir: &Path, exit_code: i32) {
        let log_name = self.write_scraper_log(task, task_dir).await;
        self.arena.stop(&ContainerRole::Monitor).await;
        info!(task_id = %task.id, exit_code, "scraper已退出");
        let payload = EventPayload {
            exit_code: Some(exit_code),
            log: log_name,
            stats: Some(self.stats.current()),
            ..self.tails()
        };
        self.report(TaskStatus::ScraperCompleted, payload).await;
    }

    async fn write_scraper_log(&mut self, task: &Task, task_dir: &Path) -> Option<String> {
        let name = self
            .arena
            .handles
            .get(&ContainerRole::Scraper)
            .cloned()?;
        match self.runtime.logs(&name, None).await {
            Ok(logs) => self.last_logs = logs,
            Err(e) => warn!(task_id = %task.id, "读取scraper完整日志失败: {}", e),
        }
        let log_name = specs::log_file_name(task);
        let content = format!("{}{}", self.last_logs.stdout, self.last_logs.stderr);
        match tokio::fs::write(task_dir.join(&log_name), content).await {
            Ok(()) => Some(log_name),
            Err(e) => {
                warn!(task_id = %task.id, "写入scraper日志失败: {}", e);
                None
            }
        }
    }

    async fn advance_uploads(&mut self, task: &Task, task_dir: &str, uploads: &mut Uploads) {
        let targets = &task.config.upload;
        let factory = SpecFactory {
            task,
            task_dir,
            settings: &self.settings,
        };

        if let Some(target) = targets.logs.as_ref() {
            let transition = self
                .arena
                .advance(&mut uploads.log, ExitPolicy::ZeroIsSuccess, || factory.log_uploader(target))
                .await;
            if transition == Transition::Exhausted {
                warn!(task_id = %task.id, "日志上传失败次数已达上限");
            }
        }
        if let Some(target) = targets.artifacts.as_ref() {
            let transition = self
                .arena
                .advance(&mut uploads.artifacts, ExitPolicy::ZeroIsSuccess, || {
                    factory.artifacts_uploader(target)
                })
                .await;
            if transition == Transition::Exhausted {
                warn!(task_id = %task.id, "附件上传失败次数已达上限");
            }
        }

        let mut reports = Vec::new();
        for file in uploads.files.iter_mut() {
            let name = file.name.clone();

            let transition = self
                .arena
                .advance(&mut file.check, ExitPolicy::CodeIsResult, || factory.checker(&name))
                .await;
            match transition {
                Transition::Done { exit_code, output } => {
                    file.check_result = Some(exit_code);
                    let check_log = std::fs::read_to_string(
                        Path::new(task_dir).join(format!("{name}.check.json")),
                    )
                    .ok()
                    .or(output);
                    reports.push((
                        TaskStatus::CheckedFile,
                        file_payload(&name, |f| {
                            f.check_result = Some(exit_code);
                            f.check_log = check_log;
                        }),
                    ));
                }
                Transition::Exhausted => {
                    warn!(task_id = %task.id, file = %name, "检查失败次数已达上限");
                    file.check_upload.skip_if_pending();
                }
                _ => {}
            }

            // 检查有结果之后才上传文件本身
            if file.check.state.is_resolved() {
                if let Some(target) = targets.zim.as_ref() {
                    let transition = self
                        .arena
                        .advance(&mut file.upload, ExitPolicy::ZeroIsSuccess, || {
                            factory.zim_uploader(&name, target)
                        })
                        .await;
                    match transition {
                        Transition::Started if file.upload.attempts == 0 => reports.push((
                            TaskStatus::Update,
                            file_payload(&name, |f| f.status = Some(FileStatus::Uploading)),
                        )),
                        Transition::Done { .. } => reports.push((
                            TaskStatus::UploadedFile,
                            file_payload(&name, |f| f.status = Some(FileStatus::Uploaded)),
                        )),
                        Transition::Exhausted => {
                            warn!(task_id = %task.id, file = %name, "文件上传失败次数已达上限");
                            reports.push((
                                TaskStatus::FailedFile,
                                file_payload(&name, |f| f.status = Some(FileStatus::Failed)),
                            ));
                        }
                        _ => {}
                    }
                }
            }

            if file.check.state == StepState::Done {
                if let Some(target) = targets.check.as_ref() {
                    let transition = self
                        .arena
                        .advance(&mut file.check_upload, ExitPolicy::ZeroIsSuccess, || {
                            factory.check_uploader(&name, target)
                        })
                        .await;
                    let status = match transition {
                        Transition::Done { .. } => Some(FileStatus::Uploaded),
                        Transition::Exhausted => Some(FileStatus::Failed),
                        _ => None,
                    };
                    if let Some(status) = status {
                        reports.push((
                            TaskStatus::Update,
                            file_payload(&name, |f| f.check_upload = Some(status)),
                        ));
                    }
                }
            }

            if file.is_resolved() && file.is_successful() && !file.cleaned {
                cleanup_file(Path::new(task_dir), &name).await;
                file.cleaned = true;
            }
        }

        for (code, payload) in reports {
            self.report(code, payload).await;
        }
    }

    /// 取消：停止抓取，限时刷出日志和附件上传，上报 `canceled` 后清理全部容器
    ///
    /// 总耗时在 `ExecutorConfig::cancel_budget_seconds` 之内，管理器据此给出停止宽限期。
    async fn cancel(
        &mut self,
        task: &Task,
        task_dir: &str,
        mut uploads: Uploads,
    ) -> SchedulerResult<ExecutorOutcome> {
        info!(task_id = %task.id, "收到取消信号");
        tokio::join!(
            self.arena.stop(&ContainerRole::Scraper),
            self.arena.stop(&ContainerRole::Monitor)
        );
        self.write_scraper_log(task, Path::new(task_dir)).await;

        // 文件上传不再进行
        uploads.files.clear();
        let deadline = Instant::now() + self.settings.cancel_flush_timeout;
        while !uploads.is_resolved() && Instant::now() < deadline {
            self.advance_uploads(task, task_dir, &mut uploads).await;
            if uploads.is_resolved() {
                break;
            }
            tokio::time::sleep(self.settings.tick.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
        if !uploads.is_resolved() {
            warn!(task_id = %task.id, "取消时日志/附件上传未在限定时间内完成");
        }

        self.report(TaskStatus::Canceled, EventPayload::default()).await;
        info!(task_id = %task.id, "任务已取消");
        self.arena.teardown().await;
        Ok(ExecutorOutcome::Canceled)
    }
}

/// 上传成功后删除文件和检查结果
async fn cleanup_file(task_dir: &Path, name: &str) {
    for path in [
        task_dir.join(name),
        task_dir.join(format!("{name}.check.json")),
    ] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "已清理"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "清理文件失败: {}", e),
        }
    }
}
