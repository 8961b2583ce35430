pub mod entities;
pub mod events;
pub mod policy;
pub mod ports;
pub mod repositories;
pub mod value_objects;

pub use entities::*;
pub use events::*;
pub use policy::*;
pub use ports::*;
pub use repositories::*;
pub use value_objects::*;
pub use zimfarm_core::{SchedulerError, SchedulerResult};
