pub mod errors;

pub use errors::*;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
