pub mod effects;
pub mod scheduler;
