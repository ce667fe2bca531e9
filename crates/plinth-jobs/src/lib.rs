//! # Plinth Jobs
//!
//! Job runtime: one-shot, continuous, interval, multi-instance and
//! cron-scheduled execution with distributed locking, queue-consumer jobs,
//! work-item dispatch with progress reports, and a console host with
//! graceful shutdown.

pub mod console;
pub mod job;
pub mod queue_job;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod work_item;

pub use console::{run_in_console, ConsoleOptions};
pub use job::{Job, JobContext, JobResult};
pub use queue_job::{QueueEntryContext, QueueEntryProcessor, QueueJob, QueueJobOptions};
pub use runner::{ContinuePredicate, JobOptions, JobRunner};
pub use scheduler::{ScheduledJobRunner, ScheduledJobStatus};
pub use shutdown::ShutdownSignal;
pub use work_item::{
    enqueue_work_item, enqueue_work_item_with_options, WorkItemContext, WorkItemEnvelope,
    WorkItemHandlers, WorkItemJob, WorkItemPayload, WorkItemStatus,
};
