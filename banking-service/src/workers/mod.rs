pub mod scheduler;

pub use scheduler::{SchedulerConfig, SyncScheduler, TickSummary};
