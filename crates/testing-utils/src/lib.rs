//! # Zimfarm Testing Utils
//!
//! 各crate共用的测试工具：实体构造器、容器运行时和后端的内存替身、等待辅助函数。
//!
//! ```toml
//! [dev-dependencies]
//! zimfarm-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
