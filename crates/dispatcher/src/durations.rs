//! 历史时长：查询表、ETA估算与完成后的时长计算

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use zimfarm_domain::{DurationScope, ScheduleDuration, Task, TaskStatus};

/// 剩余时间的下限（秒）
pub const MIN_REMAINING_SECONDS: i64 = 60;
/// ETA的放大系数
pub const ETA_MARGIN: f64 = 1.005;

/// (schedule, scope) → 秒；查不到时依次退回默认行和固定值
#[derive(Debug, Clone)]
pub struct DurationTable {
    entries: HashMap<(String, DurationScope), u64>,
    fallback_seconds: u64,
}

impl DurationTable {
    pub fn new(fallback_seconds: u64) -> Self {
        Self {
            entries: HashMap::new(),
            fallback_seconds,
        }
    }

    pub fn insert(&mut self, duration: &ScheduleDuration) {
        self.entries.insert(
            (duration.schedule_name.clone(), duration.scope.clone()),
            duration.value_seconds,
        );
    }

    pub fn with_entry(mut self, schedule: &str, scope: DurationScope, seconds: u64) -> Self {
        self.entries.insert((schedule.to_string(), scope), seconds);
        self
    }

    pub fn fallback_seconds(&self) -> u64 {
        self.fallback_seconds
    }

    pub fn seconds_for(&self, schedule: Option<&str>, worker: &str) -> u64 {
        let Some(schedule) = schedule else {
            return self.fallback_seconds;
        };
        self.entries
            .get(&(schedule.to_string(), DurationScope::Worker(worker.to_string())))
            .or_else(|| {
                self.entries
                    .get(&(schedule.to_string(), DurationScope::Default))
            })
            .copied()
            .unwrap_or(self.fallback_seconds)
    }
}

/// `max(duration − elapsed, 60s) × 1.005`
pub fn remaining_seconds(duration_seconds: u64, elapsed_seconds: i64) -> f64 {
    let duration = i64::try_from(duration_seconds).unwrap_or(i64::MAX);
    let remaining = duration.saturating_sub(elapsed_seconds).max(MIN_REMAINING_SECONDS);
    remaining as f64 * ETA_MARGIN
}

/// 运行中任务的预计完成时间
pub fn estimate_completion(task: &Task, durations: &DurationTable, now: DateTime<Utc>) -> DateTime<Utc> {
    let duration = durations.seconds_for(task.schedule_name.as_deref(), &task.worker_name);
    let elapsed = task
        .start_time()
        .map(|start| (now - start).num_seconds())
        .unwrap_or(0);
    let remaining_ms = (remaining_seconds(duration, elapsed) * 1000.0) as i64;
    now + Duration::milliseconds(remaining_ms)
}

/// 成功完成的任务的实际运行时长：scraper_completed − started
pub fn completed_duration(task: &Task) -> Option<u64> {
    let started = task.timestamps.get(&TaskStatus::Started)?;
    let completed = task.timestamps.get(&TaskStatus::ScraperCompleted)?;
    u64::try_from((*completed - *started).num_seconds()).ok()
}
