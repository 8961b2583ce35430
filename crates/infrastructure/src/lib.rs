pub mod container;
pub mod database;
pub mod notification;

pub use container::*;
pub use database::*;
pub use notification::*;
