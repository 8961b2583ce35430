use std::net::IpAddr;

use async_trait::async_trait;

use crate::entities::{Task, Worker};
use crate::events::TaskStatus;

/// 事件持久化之后同步调用
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, task: &Task, code: TaskStatus);
}

/// 不发送任何通知
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _task: &Task, _code: TaskStatus) {}
}

/// Worker来源IP变化时触发，用于更新外部白名单
#[async_trait]
pub trait IpChangeListener: Send + Sync {
    async fn on_ip_changed(&self, worker: &Worker, previous: Option<IpAddr>, current: IpAddr);
}
