//! Worker端
//!
//! 一台主机上的 Worker Fleet Manager，以及每个任务一个的 Task Executor。

pub mod executor;
pub mod http_backend;
pub mod ledger;
pub mod manager;
pub mod roles;

pub use executor::{ExecutorOutcome, ExecutorSettings, TaskExecutor};
pub use http_backend::HttpBackend;
pub use ledger::{ResourceLedger, ResourceUsage};
pub use manager::{FleetManager, FleetSettings};
pub use roles::ContainerRole;
