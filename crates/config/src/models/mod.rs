pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod executor;
pub mod notification;
pub mod observability;

pub use app_config::*;
pub use database::*;
pub use dispatcher_worker::*;
pub use executor::*;
pub use notification::*;
pub use observability::*;
