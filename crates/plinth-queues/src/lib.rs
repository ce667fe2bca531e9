//! # Plinth Queues
//!
//! Work-item transport with at-least-once delivery: visibility leases, retry
//! with backoff multipliers, dead-lettering, deduplication and pluggable
//! lifecycle behaviors, plus an in-memory reference implementation.

pub mod behavior;
pub mod entry;
pub mod memory;
pub mod queue;
pub mod worker;

pub use behavior::{LoggingQueueBehavior, MetricSubtypeFn, MetricsQueueBehavior, QueueBehavior};
pub use entry::{EntryState, QueueEntry, QueuePayload};
pub use memory::{CompletedEntry, DeadLetterEntry, InMemoryQueue};
pub use queue::{EnqueueOptions, Queue, QueueOptions, QueueStats};
pub use worker::{handler_fn, start_working, QueueEntryHandlerFn, WorkerHandle};
