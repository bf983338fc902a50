//! Operator tooling for the autotest grading service.

pub mod stat;
pub mod supervisor;

pub use stat::{queue_stats, QueueStat};
pub use supervisor::Supervisor;
