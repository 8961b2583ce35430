//! 任务匹配器
//!
//! 给定一个轮询中的Worker和它当前的空闲资源，从待执行任务中选出至多一个。
//! 匹配过程只读；并发的Worker可能拿到同一个任务，由领取事务决定归属。
//!
//! 步骤：
//! 1. 过滤：资源不超过Worker总容量、offliner受支持、Worker未暂停、归属与context满足
//! 2. 排序：优先级降序 → 历史时长降序 → 请求时间升序
//! 3. 剔除已达到平台全局上限或本Worker上限的任务
//! 4. 排名第一的任务能放进空闲资源则直接返回
//! 5. 否则按ETA顺序累加本Worker运行中任务释放的资源，直到能补足缺口，得到“空出时间”
//! 6. 时间窗口 = 空出时间 − 现在
//! 7. 在剩余候选中找第一个能放进空闲资源、且预计时长不超过时间窗口的任务

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use zimfarm_domain::{PlatformPolicy, RequestedTask, Resources, Task, Worker};

use crate::durations::{estimate_completion, DurationTable};

pub struct MatchInput<'a> {
    pub worker: &'a Worker,
    pub available: Resources,
    pub requested: &'a [RequestedTask],
    pub running: &'a [Task],
    pub durations: &'a DurationTable,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome<'a> {
    /// 排名第一的任务现在就能运行
    Immediate(&'a RequestedTask),
    /// 排名第一的任务被阻塞，选中一个能在窗口内完成的较小任务
    Backfill {
        task: &'a RequestedTask,
        window_seconds: i64,
    },
    NoMatch,
}

impl<'a> MatchOutcome<'a> {
    pub fn task(&self) -> Option<&'a RequestedTask> {
        match self {
            MatchOutcome::Immediate(task) => Some(task),
            MatchOutcome::Backfill { task, .. } => Some(task),
            MatchOutcome::NoMatch => None,
        }
    }
}

#[derive(Debug, Default)]
struct PlatformUsage {
    global: HashMap<String, u32>,
    on_worker: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskMatcher {
    policy: PlatformPolicy,
}

impl TaskMatcher {
    pub fn new(policy: PlatformPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PlatformPolicy {
        &self.policy
    }

    pub fn is_eligible(&self, worker: &Worker, task: &RequestedTask) -> bool {
        worker.accepts_new_tasks()
            && task.resources().fits_within(&worker.resources)
            && worker.supports_offliner(task.offliner())
            && worker.accepts_owner(task.worker_name.as_deref())
            && worker.accepts_context(&task.context)
    }

    /// 过滤并排序，返回物化后的候选序列
    pub fn ranked_candidates<'a>(
        &self,
        worker: &Worker,
        requested: &'a [RequestedTask],
        durations: &DurationTable,
    ) -> Vec<&'a RequestedTask> {
        let mut candidates: Vec<(&'a RequestedTask, u64)> = requested
            .iter()
            .filter(|task| self.is_eligible(worker, task))
            .map(|task| {
                let duration = durations.seconds_for(task.schedule_name.as_deref(), &worker.name);
                (task, duration)
            })
            .collect();

        candidates.sort_by(|(a, a_duration), (b, b_duration)| {
            b.priority
                .cmp(&a.priority)
                .then(b_duration.cmp(a_duration))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        candidates.into_iter().map(|(task, _)| task).collect()
    }

    fn platform_usage(&self, worker: &Worker, running: &[Task]) -> PlatformUsage {
        let mut usage = PlatformUsage::default();
        for task in running {
            let platform = self.policy.platform_for(&task.config).to_string();
            if task.worker_name == worker.name {
                *usage.on_worker.entry(platform.clone()).or_default() += 1;
            }
            *usage.global.entry(platform).or_default() += 1;
        }
        usage
    }

    fn within_platform_caps(
        &self,
        worker: &Worker,
        task: &RequestedTask,
        usage: &PlatformUsage,
    ) -> bool {
        let platform = self.policy.platform_for(&task.config);
        if let Some(max) = self.policy.global_max(platform) {
            if usage.global.get(platform).copied().unwrap_or(0) >= max {
                debug!(platform, max, "平台已达到全局并发上限");
                return false;
            }
        }
        if let Some(max) = self.policy.per_worker_max(platform, worker) {
            if usage.on_worker.get(platform).copied().unwrap_or(0) >= max {
                debug!(platform, max, worker = %worker.name, "平台已达到该Worker并发上限");
                return false;
            }
        }
        true
    }

    /// 按ETA顺序累加运行中任务的资源，返回缺口被补足的时间点
    fn opening_time(
        &self,
        shortfall: &Resources,
        worker: &Worker,
        running: &[Task],
        durations: &DurationTable,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut by_eta: Vec<(DateTime<Utc>, &Task)> = running
            .iter()
            .filter(|task| task.worker_name == worker.name)
            .map(|task| (estimate_completion(task, durations, now), task))
            .collect();
        by_eta.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut released = Resources::zero();
        let mut opening = now;
        for (eta, task) in by_eta {
            released += *task.resources();
            opening = eta;
            if shortfall.fits_within(&released) {
                break;
            }
        }
        opening
    }

    pub fn find_task<'a>(&self, input: &MatchInput<'a>) -> MatchOutcome<'a> {
        let worker = input.worker;
        let usage = self.platform_usage(worker, input.running);
        let candidates: Vec<&'a RequestedTask> = self
            .ranked_candidates(worker, input.requested, input.durations)
            .into_iter()
            .filter(|task| self.within_platform_caps(worker, task, &usage))
            .collect();

        let Some((top, rest)) = candidates.split_first() else {
            return MatchOutcome::NoMatch;
        };
        if top.resources().fits_within(&input.available) {
            return MatchOutcome::Immediate(top);
        }

        let shortfall = top.resources().shortfall(&input.available);
        let opening = self.opening_time(
            &shortfall,
            worker,
            input.running,
            input.durations,
            input.now,
        );
        let window_seconds = (opening - input.now).num_seconds();
        debug!(
            worker = %worker.name,
            blocked = %top.id,
            %shortfall,
            window_seconds,
            "首选任务资源不足，尝试在窗口内回填"
        );

        rest.iter()
            .find(|task| {
                let duration = input
                    .durations
                    .seconds_for(task.schedule_name.as_deref(), &worker.name);
                task.resources().fits_within(&input.available)
                    && i64::try_from(duration).unwrap_or(i64::MAX) <= window_seconds
            })
            .map(|task| MatchOutcome::Backfill {
                task,
                window_seconds,
            })
            .unwrap_or(MatchOutcome::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use zimfarm_domain::{DurationScope, PlatformLimits};
    use zimfarm_testing_utils::{RequestedTaskBuilder, TaskBuilder, WorkerBuilder};

    fn run(
        matcher: &TaskMatcher,
        worker: &Worker,
        available: Resources,
        requested: &[RequestedTask],
        running: &[Task],
        durations: &DurationTable,
    ) -> Option<RequestedTask> {
        matcher
            .find_task(&MatchInput {
                worker,
                available,
                requested,
                running,
                durations,
                now: Utc::now(),
            })
            .task()
            .cloned()
    }

    #[test]
    fn test_simple_match() {
        let worker = WorkerBuilder::new("w").resources(1, 1, 1).offliners(&["x"]).build();
        let job = RequestedTaskBuilder::new("x").resources(1, 1, 1).build();
        let found = run(
            &TaskMatcher::default(),
            &worker,
            worker.resources,
            &[job.clone()],
            &[],
            &DurationTable::new(86400),
        );
        assert_eq!(found.map(|t| t.id), Some(job.id));
    }

    #[test]
    fn test_missing_context_never_matches() {
        let worker = WorkerBuilder::new("w").resources(1, 1, 1).offliners(&["x"]).build();
        let job = RequestedTaskBuilder::new("x")
            .resources(1, 1, 1)
            .context("priority")
            .build();
        let found = run(
            &TaskMatcher::default(),
            &worker,
            worker.resources,
            &[job],
            &[],
            &DurationTable::new(86400),
        );
        assert!(found.is_none());
    }

    #[test]
    fn test_context_with_whitelisted_ip() {
        let ip = "192.0.2.10".parse().expect("ip");
        let job = RequestedTaskBuilder::new("x")
            .resources(1, 1, 1)
            .context("wikimedia")
            .build();
        let durations = DurationTable::new(86400);
        let matcher = TaskMatcher::default();

        let stale = WorkerBuilder::new("w")
            .resources(1, 1, 1)
            .offliners(&["x"])
            .context("wikimedia", Some(ip))
            .build();
        assert!(run(&matcher, &stale, stale.resources, &[job.clone()], &[], &durations).is_none());

        let current = WorkerBuilder::new("w")
            .resources(1, 1, 1)
            .offliners(&["x"])
            .context("wikimedia", Some(ip))
            .last_ip(ip)
            .build();
        assert!(run(&matcher, &current, current.resources, &[job], &[], &durations).is_some());
    }

    #[test]
    fn test_admission_uses_total_capacity() {
        let worker = WorkerBuilder::new("w").resources(2, 10, 10).offliners(&["x"]).build();
        let too_big = RequestedTaskBuilder::new("x").resources(3, 1, 1).priority(10).build();
        let fits = RequestedTaskBuilder::new("x").resources(2, 1, 1).build();
        let found = run(
            &TaskMatcher::default(),
            &worker,
            worker.resources,
            &[too_big, fits.clone()],
            &[],
            &DurationTable::new(86400),
        );
        assert_eq!(found.map(|t| t.id), Some(fits.id));
    }

    #[test]
    fn test_selfish_worker_only_takes_pinned_jobs() {
        let worker = WorkerBuilder::new("w")
            .resources(4, 4, 4)
            .offliners(&["x"])
            .selfish()
            .build();
        let unpinned = RequestedTaskBuilder::new("x").priority(10).build();
        let other = RequestedTaskBuilder::new("x").priority(9).worker("other").build();
        let mine = RequestedTaskBuilder::new("x").worker("w").build();

        let found = run(
            &TaskMatcher::default(),
            &worker,
            worker.resources,
            &[unpinned, other, mine.clone()],
            &[],
            &DurationTable::new(86400),
        );
        assert_eq!(found.map(|t| t.id), Some(mine.id));
    }

    #[test]
    fn test_paused_worker_gets_nothing() {
        let worker = WorkerBuilder::new("w")
            .resources(4, 4, 4)
            .offliners(&["x"])
            .cordoned()
            .build();
        let job = RequestedTaskBuilder::new("x").build();
        assert!(run(
            &TaskMatcher::default(),
            &worker,
            worker.resources,
            &[job],
            &[],
            &DurationTable::new(86400)
        )
        .is_none());
    }

    #[test]
    fn test_ranking_priority_duration_age() {
        let worker = WorkerBuilder::new("w").resources(4, 4, 4).offliners(&["x"]).build();
        let now = Utc::now();
        let old_short = RequestedTaskBuilder::new("x")
            .schedule("short")
            .created_at(now - Duration::hours(2))
            .build();
        let new_long = RequestedTaskBuilder::new("x")
            .schedule("long")
            .created_at(now - Duration::hours(1))
            .build();
        let oldest_short = RequestedTaskBuilder::new("x")
            .schedule("short2")
            .created_at(now - Duration::hours(3))
            .build();
        let urgent = RequestedTaskBuilder::new("x").priority(5).build();
        let durations = DurationTable::new(60)
            .with_entry("long", DurationScope::Default, 7200)
            .with_entry("short", DurationScope::Worker("w".into()), 600)
            .with_entry("short2", DurationScope::Default, 600);

        let requested = vec![
            old_short.clone(),
            new_long.clone(),
            oldest_short.clone(),
            urgent.clone(),
        ];
        let ranked: Vec<_> = TaskMatcher::default()
            .ranked_candidates(&worker, &requested, &durations)
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(
            ranked,
            vec![urgent.id, new_long.id, oldest_short.id, old_short.id]
        );
    }

    #[test]
    fn test_platform_global_and_worker_caps() {
        let policy = PlatformPolicy::default()
            .with_offliner_platform("youtube", "yt")
            .with_limit(
                "yt",
                PlatformLimits {
                    global_max: Some(2),
                    per_worker_default: Some(1),
                },
            );
        let matcher = TaskMatcher::new(policy);
        let worker = WorkerBuilder::new("w")
            .resources(8, 8, 8)
            .offliners(&["youtube", "x"])
            .build();
        let yt = RequestedTaskBuilder::new("youtube").priority(10).build();
        let other = RequestedTaskBuilder::new("x").build();
        let requested = vec![yt.clone(), other.clone()];
        let durations = DurationTable::new(3600);

        let elsewhere = TaskBuilder::new("youtube").worker("w2").build();
        let found = run(&matcher, &worker, worker.resources, &requested, &[elsewhere.clone()], &durations);
        assert_eq!(found.map(|t| t.id), Some(yt.id));

        // 本Worker已有一个youtube任务
        let mine = TaskBuilder::new("youtube").worker("w").build();
        let found = run(&matcher, &worker, worker.resources, &requested, &[mine], &durations);
        assert_eq!(found.map(|t| t.id), Some(other.id));

        // 全局已有两个
        let elsewhere2 = TaskBuilder::new("youtube").worker("w3").build();
        let found = run(
            &matcher,
            &worker,
            worker.resources,
            &requested,
            &[elsewhere, elsewhere2],
            &durations,
        );
        assert_eq!(found.map(|t| t.id), Some(other.id));

        // Worker自身覆盖值放宽本地上限
        let generous = WorkerBuilder::new("w")
            .resources(8, 8, 8)
            .offliners(&["youtube", "x"])
            .platform_override("yt", 3)
            .build();
        let mine = TaskBuilder::new("youtube").worker("w").build();
        let found = run(&matcher, &generous, generous.resources, &requested, &[mine], &durations);
        assert_eq!(found.map(|t| t.id), Some(yt.id));
    }

    #[test]
    fn test_backlog_window_picks_short_job() {
        let now = Utc::now();
        let worker = WorkerBuilder::new("w").resources(3, 100, 100).offliners(&["x"]).build();
        let blocking = TaskBuilder::new("x")
            .worker("w")
            .schedule("running")
            .resources(2, 10, 10)
            .started_at(now)
            .build();
        let top = RequestedTaskBuilder::new("x")
            .schedule("big")
            .resources(3, 10, 10)
            .priority(10)
            .build();
        let medium = RequestedTaskBuilder::new("x")
            .schedule("medium")
            .resources(1, 10, 10)
            .build();
        let short = RequestedTaskBuilder::new("x")
            .schedule("short")
            .resources(1, 10, 10)
            .build();
        let durations = DurationTable::new(86400)
            .with_entry("running", DurationScope::Default, 1800)
            .with_entry("medium", DurationScope::Default, 2700)
            .with_entry("short", DurationScope::Default, 600);
        let requested = vec![top.clone(), medium.clone(), short.clone()];
        let running = vec![blocking];

        let outcome = TaskMatcher::default().find_task(&MatchInput {
            worker: &worker,
            available: Resources::new(1, 90, 90),
            requested: &requested,
            running: &running,
            durations: &durations,
            now,
        });

        match outcome {
            MatchOutcome::Backfill {
                task,
                window_seconds,
            } => {
                assert_eq!(task.id, short.id);
                assert!((1800..=1815).contains(&window_seconds));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_backlog_without_fitting_candidate() {
        let now = Utc::now();
        let worker = WorkerBuilder::new("w").resources(2, 10, 10).offliners(&["x"]).build();
        let top = RequestedTaskBuilder::new("x").resources(2, 1, 1).priority(1).build();
        let long = RequestedTaskBuilder::new("x").resources(1, 1, 1).build();
        let durations = DurationTable::new(86400);

        // 没有运行中任务时窗口为0，任何有时长的任务都放不进去
        let requested = vec![top, long];
        let outcome = TaskMatcher::default().find_task(&MatchInput {
            worker: &worker,
            available: Resources::new(1, 10, 10),
            requested: &requested,
            running: &[],
            durations: &durations,
            now,
        });
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }
}
