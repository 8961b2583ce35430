pub mod backend;
pub mod notification;

pub use backend::*;
pub use notification::*;
