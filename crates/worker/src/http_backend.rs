//! 调度后端的HTTP客户端
//!
//! 连接失败和5xx按配置次数重试，退避时间带随机抖动；4xx直接映射为领域错误。

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;
use zimfarm_config::WorkerConfig;
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{
    Backend, CheckIn, ClaimOutcome, EventReport, OfferRequest, RequestedTask,
    RequestedTaskFilter, Task,
};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct HttpBackend {
    base_url: String,
    http_client: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, retries: u32, backoff: Duration) -> SchedulerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            retries,
            backoff,
        })
    }

    pub fn from_config(base_url: &str, config: &WorkerConfig) -> SchedulerResult<Self> {
        Self::new(
            base_url,
            config.request_retries,
            Duration::from_millis(config.request_backoff_ms),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 第n次重试等待 backoff × 2^n，再加上至多一半的随机抖动
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    async fn send_with_retry<F>(&self, build: F) -> SchedulerResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) if response.status().is_server_error() && attempt < self.retries => {
                    warn!(backend = %self.base_url, status = %response.status(), attempt, "后端返回服务端错误，稍后重试");
                }
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retries => {
                    warn!(backend = %self.base_url, attempt, "请求后端失败，稍后重试: {}", e);
                }
                Err(e) => {
                    return Err(SchedulerError::Network(format!(
                        "请求后端 {} 失败: {e}",
                        self.base_url
                    )))
                }
            }
            tokio::time::sleep(self.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    async fn error_from(response: Response, not_found: SchedulerError) -> SchedulerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        match status {
            StatusCode::NOT_FOUND => not_found,
            StatusCode::CONFLICT => SchedulerError::Conflict(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                SchedulerError::InvalidParams(message)
            }
            _ => SchedulerError::Network(format!("HTTP {status}: {message}")),
        }
    }

    async fn data<T: DeserializeOwned>(response: Response) -> SchedulerResult<Option<T>> {
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| SchedulerError::Serialization(format!("解析后端响应失败: {e}")))?;
        Ok(envelope.data)
    }

    async fn expect_data<T: DeserializeOwned>(response: Response) -> SchedulerResult<T> {
        Self::data(response)
            .await?
            .ok_or_else(|| SchedulerError::Serialization("后端响应缺少data字段".to_string()))
    }
}

fn filter_query(filter: &RequestedTaskFilter) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if !filter.offliners.is_empty() {
        query.push(("offliners", filter.offliners.join(",")));
    }
    if let Some(ref worker) = filter.worker_name {
        query.push(("worker_name", worker.clone()));
    }
    if let Some(min) = filter.priority_min {
        query.push(("priority_min", min.to_string()));
    }
    if !filter.schedule_names.is_empty() {
        query.push(("schedule_names", filter.schedule_names.join(",")));
    }
    if let Some(limit) = filter.limit {
        query.push(("limit", limit.to_string()));
    }
    query
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn offer(&self, request: &OfferRequest) -> SchedulerResult<Option<RequestedTask>> {
        let url = self.url("/v1/requested-tasks/offer");
        let response = self
            .send_with_retry(|| self.http_client.post(&url).json(request))
            .await?;
        if !response.status().is_success() {
            return Err(
                Self::error_from(response, SchedulerError::worker_not_found(&request.worker_name))
                    .await,
            );
        }
        Self::data(response).await
    }

    async fn claim(&self, task_id: Uuid, worker_name: &str) -> SchedulerResult<ClaimOutcome> {
        let url = self.url(&format!("/v1/tasks/{task_id}/claim"));
        let body = json!({ "worker_name": worker_name });
        let response = self
            .send_with_retry(|| self.http_client.post(&url).json(&body))
            .await?;
        match response.status() {
            StatusCode::CONFLICT => {
                debug!(%task_id, worker = worker_name, "领取冲突");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            status if status.is_success() => {
                let task: Task = Self::expect_data(response).await?;
                Ok(ClaimOutcome::Claimed(Box::new(task)))
            }
            _ => Err(Self::error_from(response, SchedulerError::worker_not_found(worker_name)).await),
        }
    }

    async fn report_event(&self, task_id: Uuid, report: &EventReport) -> SchedulerResult<()> {
        let url = self.url(&format!("/v1/tasks/{task_id}"));
        let response = self
            .send_with_retry(|| self.http_client.patch(&url).json(report))
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, SchedulerError::task_not_found(task_id)).await);
        }
        Ok(())
    }

    async fn check_in(&self, check_in: &CheckIn) -> SchedulerResult<()> {
        let url = self.url(&format!("/v1/workers/{}/check-in", check_in.worker_name));
        let response = self
            .send_with_retry(|| self.http_client.post(&url).json(check_in))
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(
                response,
                SchedulerError::worker_not_found(&check_in.worker_name),
            )
            .await);
        }
        Ok(())
    }

    async fn get_job(&self, task_id: Uuid) -> SchedulerResult<Task> {
        let url = self.url(&format!("/v1/tasks/{task_id}"));
        let response = self.send_with_retry(|| self.http_client.get(&url)).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, SchedulerError::task_not_found(task_id)).await);
        }
        Self::expect_data(response).await
    }

    async fn get_requested_jobs(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>> {
        let url = self.url("/v1/requested-tasks");
        let query = filter_query(filter);
        let response = self
            .send_with_retry(|| self.http_client.get(&url).query(&query))
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(
                response,
                SchedulerError::Internal("请求列表接口不存在".to_string()),
            )
            .await);
        }
        Ok(Self::data(response).await?.unwrap_or_default())
    }
}
