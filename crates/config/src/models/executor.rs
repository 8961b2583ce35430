use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 任务执行器（单个任务的控制循环）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub report_interval_seconds: u64,
    pub dnscache_image: String,
    pub monitor_image: Option<String>,
    pub uploader_image: String,
    pub checker_image: String,
    /// 每个上传/检查动作的最大尝试次数
    pub max_attempts: u32,
    /// CPU百分比指数移动平均的平滑系数
    pub cpu_smoothing: f64,
    pub cancel_flush_timeout_seconds: u64,
    /// 相对于任务工作目录的进度文件路径
    pub progress_file: String,
    pub log_tail_lines: usize,
    pub stop_grace_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            report_interval_seconds: 60,
            dnscache_image: "ghcr.io/openzim/dnscache:latest".to_string(),
            monitor_image: None,
            uploader_image: "ghcr.io/openzim/uploader:latest".to_string(),
            checker_image: "ghcr.io/openzim/zim-tools:latest".to_string(),
            max_attempts: 5,
            cpu_smoothing: 0.6,
            cancel_flush_timeout_seconds: 60,
            progress_file: "task_progress.json".to_string(),
            log_tail_lines: 5000,
            stop_grace_seconds: 30,
        }
    }
}

impl ExecutorConfig {
    /// 取消流程的最长耗时：停止子容器、冲刷上传、再清理子容器
    pub fn cancel_budget_seconds(&self) -> u64 {
        self.stop_grace_seconds * 2 + self.cancel_flush_timeout_seconds
    }
}

impl ConfigValidator for ExecutorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_seconds(
            self.report_interval_seconds,
            "executor.report_interval_seconds",
        )?;
        ValidationUtils::validate_not_empty(&self.dnscache_image, "executor.dnscache_image")?;
        ValidationUtils::validate_not_empty(&self.uploader_image, "executor.uploader_image")?;
        ValidationUtils::validate_not_empty(&self.checker_image, "executor.checker_image")?;
        if let Some(ref image) = self.monitor_image {
            ValidationUtils::validate_not_empty(image, "executor.monitor_image")?;
        }
        ValidationUtils::validate_count(self.max_attempts as usize, "executor.max_attempts", 100)?;
        ValidationUtils::validate_ratio(self.cpu_smoothing, "executor.cpu_smoothing")?;
        ValidationUtils::validate_interval_seconds(
            self.cancel_flush_timeout_seconds,
            "executor.cancel_flush_timeout_seconds",
        )?;
        ValidationUtils::validate_not_empty(&self.progress_file, "executor.progress_file")?;
        if self.progress_file.starts_with('/') {
            return Err(crate::ConfigError::Validation(
                "executor.progress_file must be relative to the task working directory"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_count(self.log_tail_lines, "executor.log_tail_lines", 100_000)?;
        ValidationUtils::validate_interval_seconds(
            self.stop_grace_seconds,
            "executor.stop_grace_seconds",
        )?;
        Ok(())
    }
}
