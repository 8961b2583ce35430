//! 调度器指标
//!
//! 通过 `metrics` 门面上报，未安装导出器时为空操作。

use metrics::{counter, gauge, histogram};
use zimfarm_domain::TaskStatus;

use crate::matcher::MatchOutcome;

pub fn record_offer(worker: &str, outcome: &MatchOutcome<'_>) {
    let result = match outcome {
        MatchOutcome::Immediate(_) => "immediate",
        MatchOutcome::Backfill { .. } => "backfill",
        MatchOutcome::NoMatch => "none",
    };
    counter!("zimfarm_offers_total", "worker" => worker.to_string(), "result" => result)
        .increment(1);
}

pub fn record_offer_latency(seconds: f64) {
    histogram!("zimfarm_offer_duration_seconds").record(seconds);
}

pub fn record_claim(claimed: bool) {
    let result = if claimed { "claimed" } else { "conflict" };
    counter!("zimfarm_claims_total", "result" => result).increment(1);
}

pub fn record_event(code: TaskStatus) {
    counter!("zimfarm_task_events_total", "code" => code.as_str()).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("zimfarm_requested_tasks").set(depth as f64);
}
