//! Background synchronization: the single-flag scheduler and the per-source scheduler.

pub mod scheduler;
pub mod source_scheduler;
pub mod tasks;

pub use scheduler::{SchedulerState, SyncScheduler, SyncSettings, SyncTask};
pub use source_scheduler::SourceSyncScheduler;
pub use tasks::{TimeTrackingSync, DEFAULT_TIMESHEET_PAGE_SIZE};
