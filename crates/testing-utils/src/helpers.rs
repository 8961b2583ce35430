//! Test helper utilities

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// 轮询条件直到成立或超时；返回条件最终是否成立
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition().await
    }
}
