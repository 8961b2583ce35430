use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use zimfarm_config::AppConfig;
use zimfarm_domain::{Backend, RequestedTask, Resources, Task, TaskStatus};
use zimfarm_infrastructure::{ContainerSpec, ContainerState, LABEL_CPU, LABEL_ROLE, LABEL_TASK_ID};
use zimfarm_testing_utils::{
    FakeContainerRuntime, RecordingBackend, RequestedTaskBuilder, TestEnv,
};
use zimfarm_worker::{ContainerRole, FleetManager, FleetSettings};

struct Harness {
    workdir: tempfile::TempDir,
    backends: Vec<Arc<RecordingBackend>>,
    runtime: Arc<FakeContainerRuntime>,
}

impl Harness {
    fn new(backends: &[&str]) -> Result<Self> {
        Ok(Self {
            workdir: tempfile::tempdir()?,
            backends: backends
                .iter()
                .map(|name| Arc::new(RecordingBackend::new(name)))
                .collect(),
            runtime: Arc::new(FakeContainerRuntime::new()),
        })
    }

    fn settings(&self) -> FleetSettings {
        let mut config = AppConfig::default();
        config.worker.name = "w1".to_string();
        config.worker.cpu = 3;
        config.worker.memory = 3000;
        config.worker.disk = 3000;
        config.worker.workdir = self.workdir.path().to_string_lossy().to_string();
        config.worker.claim_cooldown_seconds = 0;
        FleetSettings::from_config(&config)
    }

    fn manager_with(&self, settings: FleetSettings) -> Result<FleetManager> {
        let backends: Vec<Arc<dyn Backend>> = self
            .backends
            .iter()
            .map(|b| b.clone() as Arc<dyn Backend>)
            .collect();
        Ok(FleetManager::new(settings, backends, self.runtime.clone())?)
    }

    fn manager(&self) -> Result<FleetManager> {
        self.manager_with(self.settings())
    }

    /// 在第一个后端排队一个任务，并让领取返回对应的 Task
    fn queue_job(&self, cpu: u32) -> RequestedTask {
        let requested = RequestedTaskBuilder::new("mwoffliner")
            .schedule("wikipedia_fr")
            .resources(cpu, 1000, 1000)
            .build();
        let backend = &self.backends[0];
        backend.push_offer(requested.clone());
        backend.set_job(Task::from_requested(requested.clone(), "w1"));
        requested
    }
}

#[tokio::test]
async fn test_claimed_job_gets_an_executor_container() -> Result<()> {
    let h = Harness::new(&["http://dispatcher:8000"])?;
    let mut manager = h.manager()?;
    let requested = h.queue_job(2);

    let launched = manager.poll_once().await?;
    assert_eq!(launched, Some(requested.id));
    assert_eq!(manager.watched_tasks(), vec![requested.id]);

    let runs = h.runtime.runs_matching(ContainerRole::TASK_WORKER);
    assert_eq!(runs.len(), 1);
    let spec = &runs[0];
    assert_eq!(spec.labels[LABEL_CPU], "2");
    assert_eq!(spec.labels[LABEL_TASK_ID], requested.id.to_string());
    assert!(spec.command.contains(&"task-executor".to_string()));
    assert!(spec.command.contains(&requested.id.to_string()));

    let config_path = h
        .workdir
        .path()
        .join(requested.id.to_string())
        .join("executor.toml");
    let config = AppConfig::from_toml(&std::fs::read_to_string(config_path)?)?;
    assert_eq!(config.worker.backends, vec!["http://dispatcher:8000".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_offer_uses_ledger_availability() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let mut manager = h.manager()?;
    h.queue_job(2);

    manager.poll_once().await?;
    manager.poll_once().await?;

    let requests = h.backends[0].offer_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].available, Resources::new(3, 3000, 3000));
    // 第二轮扣除了新任务的预留
    assert_eq!(requests[1].available, Resources::new(1, 2000, 2000));
    assert_eq!(requests[1].worker_name, "w1");
    Ok(())
}

#[tokio::test]
async fn test_lost_claim_race_is_a_no_op() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let mut manager = h.manager()?;
    h.queue_job(1);
    h.backends[0].conflict_next_claims(1);

    assert_eq!(manager.poll_once().await?, None);
    assert!(h.runtime.runs().is_empty());
    assert!(manager.watched_tasks().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reconcile_recovers_running_and_clears_exited() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let running = uuid::Uuid::new_v4();
    let finished = uuid::Uuid::new_v4();
    for (task_id, state) in [
        (running, ContainerState::Running),
        (finished, ContainerState::Exited(0)),
    ] {
        let role = ContainerRole::TaskWorker;
        let mut spec = ContainerSpec::new(role.container_name(task_id), "task-worker");
        spec.labels = role.labels(task_id);
        h.runtime.insert_container(&spec, state);
    }

    let mut manager = h.manager()?;
    manager.poll_once().await?;

    assert_eq!(manager.watched_tasks(), vec![running]);
    assert_eq!(
        h.runtime.container_names(),
        vec![ContainerRole::TaskWorker.container_name(running)]
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_marker_stops_executor_once() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let mut manager = h.manager()?;
    let requested = h.queue_job(1);
    manager.poll_once().await?;

    let mut task = Task::from_requested(requested.clone(), "w1");
    task.status = TaskStatus::CancelRequested;
    task.timestamps.insert(TaskStatus::CancelRequested, Utc::now());
    task.canceled_by = Some("admin".to_string());
    h.backends[0].set_job(task);

    // 停止在后台进行，轮询本身立即返回
    manager.poll_once().await?;
    let runtime = h.runtime.clone();
    let stopped = TestEnv::wait_for(
        || {
            let runtime = runtime.clone();
            async move { !runtime.stops().is_empty() }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(stopped);
    manager.poll_once().await?;

    let container = ContainerRole::TaskWorker.container_name(requested.id);
    assert_eq!(h.runtime.stops(), vec![container]);
    assert!(manager.watched_tasks().is_empty());
    // 执行器未报终态就退出，管理器补报 Canceled
    let reports = h.backends[0].reports(requested.id);
    let last = reports.last().expect("missing terminal report");
    assert_eq!(last.code, TaskStatus::Canceled);
    assert_eq!(last.payload.canceled_by.as_deref(), Some("admin"));
    Ok(())
}

#[tokio::test]
async fn test_stop_grace_covers_executor_cancel_budget() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let settings = h.settings();
    let budget = settings.executor.cancel_budget_seconds();
    assert!(settings.stop_grace() > Duration::from_secs(budget));
    assert_eq!(
        settings.stop_grace(),
        Duration::from_secs(budget + settings.worker.stop_grace_seconds)
    );
    Ok(())
}

#[tokio::test]
async fn test_exited_executor_with_unfinished_task_is_failed() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let mut manager = h.manager()?;
    let requested = h.queue_job(1);
    manager.poll_once().await?;

    // 执行器崩溃，留下仍在运行的scraper
    let role = ContainerRole::Scraper;
    let mut sidecar = ContainerSpec::new(role.container_name(requested.id), "openzim/mwoffliner");
    sidecar.labels = role.labels(requested.id);
    h.runtime.insert_container(&sidecar, ContainerState::Running);
    h.runtime
        .exit(&ContainerRole::TaskWorker.container_name(requested.id), 137);

    manager.poll_once().await?;

    assert!(manager.watched_tasks().is_empty());
    let reports = h.backends[0].reports(requested.id);
    let failed = reports
        .iter()
        .find(|r| r.code == TaskStatus::Failed)
        .expect("missing failed report");
    assert!(failed
        .payload
        .exception
        .as_deref()
        .is_some_and(|e| e.contains("137")));
    assert!(h.runtime.stops().contains(&sidecar.name));
    assert!(h.runtime.container_names().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exited_executor_with_finished_task_is_left_alone() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let mut manager = h.manager()?;
    let requested = h.queue_job(1);
    manager.poll_once().await?;

    let mut task = Task::from_requested(requested.clone(), "w1");
    task.status = TaskStatus::Succeeded;
    task.timestamps.insert(TaskStatus::Succeeded, Utc::now());
    h.backends[0].set_job(task);
    h.runtime
        .exit(&ContainerRole::TaskWorker.container_name(requested.id), 0);

    manager.poll_once().await?;

    assert!(manager.watched_tasks().is_empty());
    assert!(h.backends[0].reports(requested.id).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_round_robin_and_check_in_reach_every_backend() -> Result<()> {
    let h = Harness::new(&["a", "b"])?;
    let mut manager = h.manager()?;

    manager.check_in().await;
    manager.poll_once().await?;
    manager.poll_once().await?;
    manager.poll_once().await?;

    assert_eq!(h.backends[0].offer_requests().len(), 2);
    assert_eq!(h.backends[1].offer_requests().len(), 1);
    for backend in &h.backends {
        let check_ins = backend.check_ins();
        assert_eq!(check_ins.len(), 1);
        assert_eq!(check_ins[0].resources, Resources::new(3, 3000, 3000));
        assert_eq!(check_ins[0].offliners, vec!["mwoffliner".to_string()]);
    }
    Ok(())
}

#[tokio::test]
async fn test_cordoned_worker_does_not_ask_for_work() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let mut settings = h.settings();
    settings.worker.cordoned = true;
    let mut manager = h.manager_with(settings)?;
    h.queue_job(1);

    assert_eq!(manager.poll_once().await?, None);
    assert!(h.backends[0].offer_requests().is_empty());

    manager.check_in().await;
    assert!(h.backends[0].check_ins()[0].cordoned);
    Ok(())
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() -> Result<()> {
    let h = Harness::new(&["dispatcher"])?;
    let manager = h.manager()?;
    h.queue_job(1);

    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(manager.run(rx));

    let backend = h.backends[0].clone();
    let ready = TestEnv::wait_for(
        || {
            let backend = backend.clone();
            async move { !backend.check_ins().is_empty() && !backend.claims().is_empty() }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(ready);

    tx.send(())?;
    handle.await??;
    assert_eq!(
        h.runtime
            .runs()
            .iter()
            .filter(|spec| spec.labels.get(LABEL_ROLE).map(String::as_str)
                == Some(ContainerRole::TASK_WORKER))
            .count(),
        1
    );
    Ok(())
}
