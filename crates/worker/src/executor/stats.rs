//! 抓取容器的统计、进度文件和日志截取

use std::path::Path;

use tracing::debug;
use zimfarm_domain::{ContainerStats, Progress};
use zimfarm_infrastructure::ContainerUsage;

/// CPU百分比的指数移动平均，外加内存和磁盘的峰值
#[derive(Debug, Clone)]
pub struct StatsTracker {
    smoothing: f64,
    cpu_percent: Option<f64>,
    memory_max: u64,
    disk_max: u64,
}

impl StatsTracker {
    /// `smoothing` 为新样本的权重
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing,
            cpu_percent: None,
            memory_max: 0,
            disk_max: 0,
        }
    }

    pub fn record(&mut self, usage: Option<ContainerUsage>, disk_bytes: u64) -> ContainerStats {
        if let Some(usage) = usage {
            let smoothed = match self.cpu_percent {
                None => usage.cpu_percent,
                Some(previous) => {
                    self.smoothing * usage.cpu_percent + (1.0 - self.smoothing) * previous
                }
            };
            self.cpu_percent = Some(smoothed);
            self.memory_max = self.memory_max.max(usage.memory_bytes);
        }
        self.disk_max = self.disk_max.max(disk_bytes);
        self.current()
    }

    pub fn current(&self) -> ContainerStats {
        ContainerStats {
            cpu_percent: self.cpu_percent.unwrap_or(0.0),
            memory_max: self.memory_max,
            disk_max: self.disk_max,
        }
    }
}

/// 抓取程序可选写入的进度文件；不存在或格式不对时返回 None
pub fn read_progress(path: &Path) -> Option<Progress> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(progress) => Some(progress),
        Err(e) => {
            debug!(path = %path.display(), "进度文件无法解析: {}", e);
            None
        }
    }
}

/// 目录占用的字节数，读不到的条目忽略
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

/// 最后 `lines` 行
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_smoothed_and_peaks_kept() {
        let mut tracker = StatsTracker::new(0.6);
        let usage = |cpu, mem| {
            Some(ContainerUsage {
                cpu_percent: cpu,
                memory_bytes: mem,
            })
        };
        tracker.record(usage(100.0, 500), 10);
        let stats = tracker.record(usage(50.0, 200), 5);
        assert!((stats.cpu_percent - 70.0).abs() < 1e-9);
        assert_eq!(stats.memory_max, 500);
        assert_eq!(stats.disk_max, 10);

        // 容器统计暂时不可用时保持上一次的值
        let stats = tracker.record(None, 30);
        assert!((stats.cpu_percent - 70.0).abs() < 1e-9);
        assert_eq!(stats.disk_max, 30);
    }

    #[test]
    fn test_progress_and_dir_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let progress_path = dir.path().join("task_progress.json");
        assert!(read_progress(&progress_path).is_none());

        std::fs::write(&progress_path, r#"{"done": 3, "total": 4}"#).expect("write");
        let progress = read_progress(&progress_path).expect("progress");
        assert_eq!(progress.overall(), 75);
        assert!(!progress.partial_zim);

        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/a.zim"), vec![0u8; 100]).expect("write");
        let expected = 100 + std::fs::metadata(&progress_path).expect("meta").len();
        assert_eq!(dir_size(dir.path()), expected);
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 5), "");
    }
}
