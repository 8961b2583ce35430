use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use zimfarm_core::SchedulerError;
use zimfarm_dispatcher::{NewRequestedTask, SchedulerService};
use zimfarm_domain::{
    CheckIn, ClaimOutcome, DurationScope, EventPayload, EventReport, IpChangeListener,
    OfferRequest, PlatformPolicy, RequestedTaskFilter, Resources,
    ScheduleDurationRepository, ScheduleRepository, TaskStatus, TaskStore, Worker,
};
use zimfarm_infrastructure::InMemoryStore;
use zimfarm_testing_utils::{test_config, RecordingNotifier};

#[derive(Default)]
struct RecordingIpListener {
    changes: Mutex<Vec<(String, Option<IpAddr>, IpAddr)>>,
}

#[async_trait]
impl IpChangeListener for RecordingIpListener {
    async fn on_ip_changed(&self, worker: &Worker, previous: Option<IpAddr>, current: IpAddr) {
        self.changes
            .lock()
            .unwrap()
            .push((worker.name.clone(), previous, current));
    }
}

struct Harness {
    service: Arc<SchedulerService>,
    store: Arc<dyn TaskStore>,
    notifier: Arc<RecordingNotifier>,
    ip_listener: Arc<RecordingIpListener>,
}

fn harness() -> Harness {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let ip_listener = Arc::new(RecordingIpListener::default());
    let service = Arc::new(SchedulerService::new(
        store.clone(),
        PlatformPolicy::default(),
        notifier.clone(),
        ip_listener.clone(),
        86400,
    ));
    Harness {
        service,
        store,
        notifier,
        ip_listener,
    }
}

fn check_in(name: &str, cpu: u32) -> CheckIn {
    CheckIn {
        worker_name: name.to_string(),
        resources: Resources::new(cpu, 1024, 1024),
        offliners: vec!["mwoffliner".to_string()],
        platform_overrides: Default::default(),
        cordoned: false,
        selfish: false,
        contexts: Default::default(),
    }
}

fn offer(name: &str, available: Resources) -> OfferRequest {
    OfferRequest {
        worker_name: name.to_string(),
        available,
        source_ip: None,
    }
}

fn scheduled(schedule: &str) -> NewRequestedTask {
    NewRequestedTask {
        schedule_name: Some(schedule.to_string()),
        ..NewRequestedTask::new(test_config("mwoffliner"))
    }
}

#[tokio::test]
async fn test_offer_for_unknown_worker_is_not_found() {
    let h = harness();
    let err = h
        .service
        .offer(&offer("ghost", Resources::new(1, 1, 1)))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_offer_claim_and_reserved_side_effects() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    let requested = h.service.request(scheduled("wikipedia_fr")).await?;

    let offered = h
        .service
        .offer(&offer("w1", Resources::new(2, 1024, 1024)))
        .await?
        .expect("job offered");
    assert_eq!(offered.id, requested.id);
    assert!(h.service.get_worker("w1").await?.last_seen.is_some());

    let outcome = h.service.claim(offered.id, "w1").await?;
    let ClaimOutcome::Claimed(task) = outcome else {
        panic!("claim rejected");
    };
    assert_eq!(task.status, TaskStatus::Reserved);
    assert_eq!(task.worker_name, "w1");
    assert!(h.service.get_requested_task(offered.id).await.is_err());
    assert_eq!(h.store.most_recent_task("wikipedia_fr").await?, Some(task.id));
    assert_eq!(h.notifier.sent(), vec![(task.id, TaskStatus::Reserved)]);

    // 已领取的任务不再出现在候选中
    assert!(h
        .service
        .offer(&offer("w1", Resources::new(2, 1024, 1024)))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_claims_have_single_winner() -> Result<()> {
    let h = harness();
    for i in 0..6 {
        h.service.check_in(&check_in(&format!("w{i}"), 2)).await?;
    }
    let requested = h.service.request(scheduled("race")).await?;

    let mut handles = Vec::new();
    for i in 0..6 {
        let service = h.service.clone();
        let id = requested.id;
        handles.push(tokio::spawn(async move {
            service.claim(id, &format!("w{i}")).await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await??.is_claimed() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

#[tokio::test]
async fn test_report_event_is_idempotent_and_records_duration() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    let requested = h.service.request(scheduled("wikipedia_fr")).await?;
    h.service.claim(requested.id, "w1").await?;

    let start = Utc::now();
    let started = EventReport::at(TaskStatus::Started, start);
    h.service.report_event(requested.id, &started).await?;
    let task = h.service.report_event(requested.id, &started).await?;
    let started_events = task
        .events
        .iter()
        .filter(|e| e.code == TaskStatus::Started)
        .count();
    assert_eq!(started_events, 1);

    let completed = EventReport::at(TaskStatus::ScraperCompleted, start + Duration::seconds(1200))
        .with_payload(EventPayload {
            exit_code: Some(0),
            ..Default::default()
        });
    h.service.report_event(requested.id, &completed).await?;

    let own = h
        .store
        .get_duration("wikipedia_fr", &DurationScope::Worker("w1".into()))
        .await?
        .expect("worker row");
    assert_eq!(own.value_seconds, 1200);
    let default = h
        .store
        .get_duration("wikipedia_fr", &DurationScope::Default)
        .await?
        .expect("default row");
    assert_eq!(default.value_seconds, 1200);

    let succeeded = EventReport::new(TaskStatus::Succeeded);
    h.service.report_event(requested.id, &succeeded).await?;
    let task = h.service.report_event(requested.id, &succeeded).await?;
    assert_eq!(task.status, TaskStatus::Succeeded);
    let terminal_events = task
        .events
        .iter()
        .filter(|e| e.code == TaskStatus::Succeeded)
        .count();
    assert_eq!(terminal_events, 1);
    Ok(())
}

#[tokio::test]
async fn test_report_event_for_unknown_task() {
    let h = harness();
    let err = h
        .service
        .report_event(uuid::Uuid::new_v4(), &EventReport::new(TaskStatus::Started))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { .. }));
}

#[tokio::test]
async fn test_request_uniqueness_and_unrequest() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;

    let first = h.service.request(scheduled("daily")).await?;
    let err = h.service.request(scheduled("daily")).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));

    // 同一个schedule指定不同Worker可以并存
    let pinned = NewRequestedTask {
        worker_name: Some("w1".to_string()),
        ..scheduled("daily")
    };
    h.service.request(pinned).await?;

    let unknown_worker = NewRequestedTask {
        worker_name: Some("ghost".to_string()),
        ..scheduled("other")
    };
    assert!(h.service.request(unknown_worker).await.unwrap_err().is_not_found());

    h.service.unrequest(first.id).await?;
    assert!(h.service.unrequest(first.id).await.unwrap_err().is_not_found());

    let remaining = h
        .service
        .list_requested_tasks(&RequestedTaskFilter::default())
        .await?;
    assert_eq!(remaining.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_records_actor_once() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    let requested = h.service.request(scheduled("daily")).await?;
    h.service.claim(requested.id, "w1").await?;

    let task = h
        .service
        .cancel(requested.id, Some("alice".to_string()))
        .await?;
    assert_eq!(task.status, TaskStatus::CancelRequested);
    assert_eq!(task.canceled_by.as_deref(), Some("alice"));

    // 执行端的后续事件不会抹掉取消标记
    let task = h
        .service
        .report_event(requested.id, &EventReport::new(TaskStatus::ScraperRunning))
        .await?;
    assert!(task.is_cancel_marked());

    let task = h.service.cancel(requested.id, Some("bob".to_string())).await?;
    assert_eq!(task.canceled_by.as_deref(), Some("alice"));

    h.service
        .report_event(requested.id, &EventReport::new(TaskStatus::Canceled))
        .await?;
    let err = h.service.cancel(requested.id, None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_reports_and_cancel_keep_every_event() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    let requested = h.service.request(scheduled("daily")).await?;
    h.service.claim(requested.id, "w1").await?;

    let base = Utc::now();
    let mut handles = Vec::new();
    for i in 0..40 {
        let service = h.service.clone();
        let id = requested.id;
        handles.push(tokio::spawn(async move {
            let report = EventReport::at(TaskStatus::ScraperRunning, base + Duration::seconds(i));
            service.report_event(id, &report).await.map(|_| ())
        }));
    }
    let service = h.service.clone();
    let id = requested.id;
    handles.push(tokio::spawn(async move {
        service.cancel(id, Some("admin".to_string())).await.map(|_| ())
    }));
    for handle in handles {
        handle.await??;
    }

    let task = h.service.get_task(requested.id).await?;
    let running = task
        .events
        .iter()
        .filter(|e| e.code == TaskStatus::ScraperRunning)
        .count();
    assert_eq!(running, 40);
    // requested + reserved + 40 次运行上报 + cancel_requested
    assert_eq!(task.events.len(), 43);
    assert!(task.is_cancel_marked());
    assert_eq!(task.canceled_by.as_deref(), Some("admin"));
    Ok(())
}

#[tokio::test]
async fn test_source_ip_change_fires_listener() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    let first: IpAddr = "198.51.100.1".parse()?;
    let second: IpAddr = "198.51.100.2".parse()?;

    for ip in [first, first, second] {
        let request = OfferRequest {
            source_ip: Some(ip),
            ..offer("w1", Resources::new(1, 1, 1))
        };
        h.service.offer(&request).await?;
    }

    let changes = h.ip_listener.changes.lock().unwrap().clone();
    assert_eq!(
        changes,
        vec![
            ("w1".to_string(), None, first),
            ("w1".to_string(), Some(first), second)
        ]
    );
    assert_eq!(h.service.get_worker("w1").await?.last_ip, Some(second));
    Ok(())
}

#[tokio::test]
async fn test_check_in_keeps_admin_flags() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    h.service.set_worker_disabled("w1", true).await?;
    h.service.request(scheduled("daily")).await?;

    let mut update = check_in("w1", 4);
    update.platform_overrides.insert("youtube".to_string(), 2);
    let worker = h.service.check_in(&update).await?;
    assert!(worker.admin_disabled);
    assert_eq!(worker.resources.cpu, 4);
    assert_eq!(worker.platform_overrides.get("youtube"), Some(&2));

    // 管理员暂停后不再分配
    assert!(h
        .service
        .offer(&offer("w1", Resources::new(4, 1024, 1024)))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_context_job_goes_to_matching_worker_only() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("plain", 2)).await?;
    let mut special = check_in("special", 2);
    special.contexts.insert("priority".to_string(), None);
    let worker = h.service.check_in(&special).await?;
    assert!(worker.accepts_context("priority"));

    let job = h
        .service
        .request(NewRequestedTask {
            context: "priority".to_string(),
            ..scheduled("vip")
        })
        .await?;

    let available = Resources::new(2, 1024, 1024);
    assert!(h.service.offer(&offer("plain", available)).await?.is_none());
    let offered = h.service.offer(&offer("special", available)).await?;
    assert_eq!(offered.map(|t| t.id), Some(job.id));

    // 再次签到去掉context后不再匹配
    h.service.check_in(&check_in("special", 2)).await?;
    assert!(h.service.offer(&offer("special", available)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_context_bound_to_ip_requires_that_source() -> Result<()> {
    let h = harness();
    let ip: IpAddr = "203.0.113.7".parse()?;
    let mut update = check_in("w1", 2);
    update.contexts.insert("priority".to_string(), Some(ip));
    h.service.check_in(&update).await?;
    h.service
        .request(NewRequestedTask {
            context: "priority".to_string(),
            ..scheduled("vip")
        })
        .await?;

    let available = Resources::new(2, 1024, 1024);
    let elsewhere = OfferRequest {
        source_ip: Some("198.51.100.1".parse()?),
        ..offer("w1", available)
    };
    assert!(h.service.offer(&elsewhere).await?.is_none());
    let from_ip = OfferRequest {
        source_ip: Some(ip),
        ..offer("w1", available)
    };
    assert!(h.service.offer(&from_ip).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_selfish_worker_only_takes_pinned_jobs() -> Result<()> {
    let h = harness();
    let mut selfish = check_in("w1", 2);
    selfish.selfish = true;
    assert!(h.service.check_in(&selfish).await?.selfish);
    let open = h.service.request(scheduled("open")).await?;

    let available = Resources::new(2, 1024, 1024);
    assert!(h.service.offer(&offer("w1", available)).await?.is_none());
    let err = h.service.claim(open.id, "w1").await.unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));

    let pinned = h
        .service
        .request(NewRequestedTask {
            worker_name: Some("w1".to_string()),
            ..scheduled("mine")
        })
        .await?;
    let offered = h.service.offer(&offer("w1", available)).await?;
    assert_eq!(offered.map(|t| t.id), Some(pinned.id));
    assert!(matches!(
        h.service.claim(pinned.id, "w1").await?,
        ClaimOutcome::Claimed(_)
    ));
    Ok(())
}

#[tokio::test]
async fn test_claim_of_job_pinned_elsewhere_is_rejected() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    h.service.check_in(&check_in("w2", 2)).await?;
    let pinned = h
        .service
        .request(NewRequestedTask {
            worker_name: Some("w1".to_string()),
            ..scheduled("daily")
        })
        .await?;

    let err = h.service.claim(pinned.id, "w2").await.unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));
    // 拒绝不产生副作用，原Worker仍可领取
    assert!(h.service.get_task(pinned.id).await.unwrap_err().is_not_found());
    assert!(matches!(
        h.service.claim(pinned.id, "w1").await?,
        ClaimOutcome::Claimed(_)
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancel_of_unclaimed_job_is_not_found() -> Result<()> {
    let h = harness();
    h.service.check_in(&check_in("w1", 2)).await?;
    let requested = h.service.request(scheduled("daily")).await?;

    // 未领取的任务通过unrequest撤销
    let err = h.service.cancel(requested.id, None).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.service.get_requested_task(requested.id).await?.id, requested.id);
    h.service.unrequest(requested.id).await?;
    Ok(())
}
