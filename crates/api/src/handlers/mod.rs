pub mod health;
pub mod requested_tasks;
pub mod tasks;
pub mod workers;
