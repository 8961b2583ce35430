//! 内存替身：容器运行时、调度后端和通知器
//!
//! 全部线程安全，可以在测试里克隆 `Arc` 后一边驱动被测对象一边检查记录。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{
    Backend, CheckIn, ClaimOutcome, EventReport, Notifier, OfferRequest, RequestedTask,
    RequestedTaskFilter, Task, TaskStatus,
};
use zimfarm_infrastructure::{
    ContainerInfo, ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerUsage,
};

/// 名字包含某个片段的容器在启动后的行为
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FakeBehavior {
    /// 一直运行，直到被stop
    Forever,
    /// 第一次inspect时就已退出
    Exit(i32),
    /// 经过若干次inspect之后退出
    ExitAfter { inspections: u32, code: i32 },
}

#[derive(Debug, Clone)]
struct FakeContainer {
    info: ContainerInfo,
    remaining: Option<u32>,
    exit_code: i32,
}

#[derive(Debug, Default)]
struct FakeRuntimeState {
    containers: BTreeMap<String, FakeContainer>,
    behaviors: Vec<(String, FakeBehavior)>,
    run_failures: HashMap<String, u32>,
    logs: Vec<(String, ContainerLogs)>,
    usage: Vec<(String, ContainerUsage)>,
    runs: Vec<ContainerSpec>,
    stops: Vec<String>,
    pulls: Vec<String>,
    next_ip: u8,
}

fn first_match<'a, T>(rules: &'a [(String, T)], name: &str) -> Option<&'a T> {
    rules
        .iter()
        .find(|(fragment, _)| name.contains(fragment.as_str()))
        .map(|(_, value)| value)
}

/// Mock implementation of ContainerRuntime for testing
#[derive(Debug, Default)]
pub struct FakeContainerRuntime {
    state: Mutex<FakeRuntimeState>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// 名字包含 `fragment` 的容器按 `behavior` 运行；先注册的规则优先
    pub fn behave(&self, fragment: &str, behavior: FakeBehavior) -> &Self {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .push((fragment.to_string(), behavior));
        self
    }

    /// 名字包含 `fragment` 的容器前 `times` 次启动失败
    pub fn fail_runs(&self, fragment: &str, times: u32) -> &Self {
        self.state
            .lock()
            .unwrap()
            .run_failures
            .insert(fragment.to_string(), times);
        self
    }

    pub fn set_logs(&self, fragment: &str, stdout: &str, stderr: &str) -> &Self {
        self.state.lock().unwrap().logs.push((
            fragment.to_string(),
            ContainerLogs {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn set_usage(&self, fragment: &str, cpu_percent: f64, memory_bytes: u64) -> &Self {
        self.state.lock().unwrap().usage.push((
            fragment.to_string(),
            ContainerUsage {
                cpu_percent,
                memory_bytes,
            },
        ));
        self
    }

    /// 直接放入一个已存在的容器，用于模拟重启前留下的容器
    pub fn insert_container(&self, spec: &ContainerSpec, state: ContainerState) {
        let mut guard = self.state.lock().unwrap();
        let info = ContainerInfo {
            id: format!("fake-{}", spec.name),
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            state,
            ip_address: None,
        };
        guard.containers.insert(
            spec.name.clone(),
            FakeContainer {
                info,
                remaining: None,
                exit_code: 0,
            },
        );
    }

    /// 让容器立即以 `code` 退出
    pub fn exit(&self, name: &str, code: i32) {
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(name) {
            container.info.state = ContainerState::Exited(code);
            container.remaining = None;
        }
    }

    pub fn runs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().runs.clone()
    }

    pub fn runs_matching(&self, fragment: &str) -> Vec<ContainerSpec> {
        self.runs()
            .into_iter()
            .filter(|spec| spec.name.contains(fragment))
            .collect()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn running_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.info.state.is_running())
            .map(|c| c.info.name.clone())
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn pull_image(&self, image: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().pulls.push(image.to_string());
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> SchedulerResult<String> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        if let Some((_, remaining)) = state
            .run_failures
            .iter_mut()
            .find(|(fragment, remaining)| spec.name.contains(fragment.as_str()) && **remaining > 0)
        {
            *remaining -= 1;
            return Err(SchedulerError::ContainerRuntime(format!(
                "模拟启动失败: {}",
                spec.name
            )));
        }
        if state
            .containers
            .get(&spec.name)
            .is_some_and(|c| c.info.state.is_running())
        {
            return Err(SchedulerError::ContainerRuntime(format!(
                "容器名已被占用: {}",
                spec.name
            )));
        }

        state.runs.push(spec.clone());
        state.next_ip = state.next_ip.wrapping_add(1);
        let behavior = first_match(&state.behaviors, &spec.name)
            .copied()
            .unwrap_or(FakeBehavior::Forever);
        let (container_state, remaining, exit_code) = match behavior {
            FakeBehavior::Forever => (ContainerState::Running, None, 0),
            FakeBehavior::Exit(code) => (ContainerState::Exited(code), None, code),
            FakeBehavior::ExitAfter { inspections, code } => {
                (ContainerState::Running, Some(inspections), code)
            }
        };

        let id = format!("fake-{}", Uuid::new_v4().simple());
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    labels: spec.labels.clone(),
                    state: container_state,
                    ip_address: Some(format!("172.17.0.{}", state.next_ip)),
                },
                remaining,
                exit_code,
            },
        );
        Ok(id)
    }

    async fn inspect(&self, name: &str) -> SchedulerResult<Option<ContainerInfo>> {
        let mut guard = self.state.lock().unwrap();
        let Some(container) = guard.containers.get_mut(name) else {
            return Ok(None);
        };
        if let Some(remaining) = container.remaining {
            if remaining == 0 {
                container.info.state = ContainerState::Exited(container.exit_code);
                container.remaining = None;
            } else {
                container.remaining = Some(remaining - 1);
            }
        }
        Ok(Some(container.info.clone()))
    }

    async fn list(&self, labels: &[(&str, &str)]) -> SchedulerResult<Vec<ContainerInfo>> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .containers
            .values()
            .filter(|c| {
                labels
                    .iter()
                    .all(|(key, value)| c.info.label(key) == Some(*value))
            })
            .map(|c| c.info.clone())
            .collect())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> SchedulerResult<()> {
        let mut guard = self.state.lock().unwrap();
        guard.stops.push(name.to_string());
        if let Some(container) = guard.containers.get_mut(name) {
            if container.info.state.is_running() {
                container.info.state = ContainerState::Exited(143);
            }
            container.remaining = None;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().containers.remove(name);
        Ok(())
    }

    async fn logs(&self, name: &str, _tail: Option<usize>) -> SchedulerResult<ContainerLogs> {
        let guard = self.state.lock().unwrap();
        Ok(first_match(&guard.logs, name).cloned().unwrap_or_default())
    }

    async fn usage(&self, name: &str) -> SchedulerResult<Option<ContainerUsage>> {
        let guard = self.state.lock().unwrap();
        if !guard.containers.contains_key(name) {
            return Ok(None);
        }
        Ok(Some(first_match(&guard.usage, name).copied().unwrap_or_default()))
    }
}

#[derive(Debug, Default)]
struct BackendState {
    offers: VecDeque<RequestedTask>,
    claim_conflicts: u32,
    jobs: HashMap<Uuid, Task>,
    events: Vec<(Uuid, EventReport)>,
    check_ins: Vec<CheckIn>,
    offer_requests: Vec<OfferRequest>,
    claims: Vec<(Uuid, String)>,
    fail_reports: u32,
}

/// Mock implementation of Backend for testing
///
/// 事件上报只记录，不修改 `jobs` 里的任务状态；需要时由测试自己 `set_job`。
#[derive(Debug)]
pub struct RecordingBackend {
    name: String,
    state: Mutex<BackendState>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new("recording")
    }
}

impl RecordingBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(BackendState::default()),
        }
    }

    pub fn push_offer(&self, task: RequestedTask) {
        self.state.lock().unwrap().offers.push_back(task);
    }

    /// 接下来 `times` 次领取返回 `AlreadyClaimed`
    pub fn conflict_next_claims(&self, times: u32) {
        self.state.lock().unwrap().claim_conflicts = times;
    }

    /// 接下来 `times` 次事件上报返回网络错误
    pub fn fail_next_reports(&self, times: u32) {
        self.state.lock().unwrap().fail_reports = times;
    }

    pub fn set_job(&self, task: Task) {
        self.state.lock().unwrap().jobs.insert(task.id, task);
    }

    pub fn events(&self) -> Vec<(Uuid, EventReport)> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn codes(&self, task_id: Uuid) -> Vec<TaskStatus> {
        self.reports(task_id).into_iter().map(|r| r.code).collect()
    }

    pub fn reports(&self, task_id: Uuid) -> Vec<EventReport> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, report)| report.clone())
            .collect()
    }

    pub fn check_ins(&self) -> Vec<CheckIn> {
        self.state.lock().unwrap().check_ins.clone()
    }

    pub fn offer_requests(&self) -> Vec<OfferRequest> {
        self.state.lock().unwrap().offer_requests.clone()
    }

    pub fn claims(&self) -> Vec<(Uuid, String)> {
        self.state.lock().unwrap().claims.clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn offer(&self, request: &OfferRequest) -> SchedulerResult<Option<RequestedTask>> {
        let mut state = self.state.lock().unwrap();
        state.offer_requests.push(request.clone());
        Ok(state.offers.pop_front())
    }

    async fn claim(&self, task_id: Uuid, worker_name: &str) -> SchedulerResult<ClaimOutcome> {
        let mut state = self.state.lock().unwrap();
        state.claims.push((task_id, worker_name.to_string()));
        if state.claim_conflicts > 0 {
            state.claim_conflicts -= 1;
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        let task = state
            .jobs
            .get(&task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::requested_task_not_found(task_id))?;
        Ok(ClaimOutcome::Claimed(Box::new(task)))
    }

    async fn report_event(&self, task_id: Uuid, report: &EventReport) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reports > 0 {
            state.fail_reports -= 1;
            return Err(SchedulerError::Network("模拟上报失败".to_string()));
        }
        state.events.push((task_id, report.clone()));
        Ok(())
    }

    async fn check_in(&self, check_in: &CheckIn) -> SchedulerResult<()> {
        self.state.lock().unwrap().check_ins.push(check_in.clone());
        Ok(())
    }

    async fn get_job(&self, task_id: Uuid) -> SchedulerResult<Task> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    async fn get_requested_jobs(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .offers
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }
}

/// Mock implementation of Notifier for testing
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, TaskStatus)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Uuid, TaskStatus)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, task: &Task, code: TaskStatus) {
        self.sent.lock().unwrap().push((task.id, code));
    }
}
