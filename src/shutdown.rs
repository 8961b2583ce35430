use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// 优雅关闭管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号；关闭之后订阅的接收器会立即收到信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭，重复调用无效果
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        debug!(
            subscribers = self.shutdown_tx.receiver_count(),
            "发送关闭信号"
        );
        // 没有订阅者时发送失败，忽略
        let _ = self.shutdown_tx.send(());
        info!("关闭信号已发送");
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 Ctrl+C 或 SIGTERM
///
/// Worker停止执行器容器时发送的就是SIGTERM，执行器据此进入取消流程。
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
