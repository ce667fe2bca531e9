//! Queue contract, configuration and statistics.

use crate::behavior::QueueBehavior;
use crate::entry::{QueueEntry, QueuePayload};
use async_trait::async_trait;
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-enqueue options
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Correlation id preserved end to end
    pub correlation_id: Option<String>,
    /// Free-form metadata carried with the entry
    pub properties: HashMap<String, String>,
    /// When set and the queue has a deduplication window configured, a
    /// concurrent enqueue with the same id inside the window is discarded
    pub deduplication_id: Option<String>,
}

impl EnqueueOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }
}

/// Queue configuration
#[derive(Clone)]
pub struct QueueOptions<T: QueuePayload> {
    /// Queue identifier
    pub name: String,
    /// Maximum additional attempts after the initial dequeue
    /// (total attempts <= retries + 1)
    pub retries: u32,
    /// Base delay before a retried entry becomes visible again
    pub retry_delay: Duration,
    /// Delay for attempt n is `retry_delay * retry_multipliers[min(n-1, len-1)]`
    pub retry_multipliers: Vec<u32>,
    /// Visibility lease per dequeue
    pub work_item_timeout: Duration,
    /// Cap on dead-letter retention; oldest entries evicted first
    pub dead_letter_max_items: usize,
    /// Bounded history of completed entries kept for inspection (0 = none)
    pub completed_entry_retention_limit: usize,
    /// Window in which a repeated deduplication id discards the enqueue
    pub deduplication_window: Option<Duration>,
    /// Lifecycle hooks invoked on queue events
    pub behaviors: Vec<Arc<dyn QueueBehavior<T>>>,
    /// Time source for leases, retry visibility and waits
    pub clock: Arc<dyn Clock>,
}

impl<T: QueuePayload> Default for QueueOptions<T> {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retries: 2,
            retry_delay: Duration::from_secs(1),
            retry_multipliers: vec![1, 3, 5, 10],
            work_item_timeout: Duration::from_secs(5 * 60),
            dead_letter_max_items: 100,
            completed_entry_retention_limit: 0,
            deduplication_window: None,
            behaviors: Vec::new(),
            clock: SystemClock::shared(),
        }
    }
}

impl<T: QueuePayload> QueueOptions<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_retry_multipliers(mut self, multipliers: Vec<u32>) -> Self {
        self.retry_multipliers = multipliers;
        self
    }

    pub fn with_work_item_timeout(mut self, timeout: Duration) -> Self {
        self.work_item_timeout = timeout;
        self
    }

    pub fn with_deduplication_window(mut self, window: Duration) -> Self {
        self.deduplication_window = Some(window);
        self
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn QueueBehavior<T>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry visibility delay for the given attempt number (1-based).
    /// The multiplier index saturates at the last table entry.
    pub fn retry_delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.retry_multipliers.is_empty() {
            return self.retry_delay;
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.retry_multipliers.len() - 1);
        self.retry_delay * self.retry_multipliers[index]
    }
}

/// Queue statistics: monotonic counters plus point-in-time gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries awaiting dequeue (including retries not yet visible)
    pub queued: u64,
    /// Entries currently held by consumers
    pub working: u64,
    /// Entries currently retained in the dead-letter sub-queue
    pub deadletter: u64,
    /// Total entries accepted
    pub enqueued: u64,
    /// Total dequeues handed out
    pub dequeued: u64,
    /// Total entries completed
    pub completed: u64,
    /// Total abandons (caller-invoked and auto-abandons)
    pub abandoned: u64,
    /// Consumer-side processing failures
    pub errors: u64,
    /// Visibility leases that expired before complete/abandon
    pub timeouts: u64,
}

/// Work-item transport with at-least-once delivery.
///
/// Entries move `Queued -> Dequeued -> (Completed | Abandoned)`; abandoned
/// entries are retried after a multiplier-table delay until the retry budget
/// is spent, then dead-lettered.
#[async_trait]
pub trait Queue<T: QueuePayload>: Send + Sync {
    /// Queue identifier
    fn name(&self) -> &str;

    /// Enqueue a value; returns the entry id
    async fn enqueue(&self, value: T) -> Result<String> {
        self.enqueue_with_options(value, EnqueueOptions::default())
            .await
    }

    /// Enqueue a value with correlation id, properties or a deduplication id
    async fn enqueue_with_options(&self, value: T, options: EnqueueOptions) -> Result<String>;

    /// Dequeue the next visible entry, waiting up to `timeout` for one to
    /// arrive. `None` (or a zero timeout) checks once without waiting.
    /// Returns `Ok(None)` when nothing became available in time.
    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<QueueEntry<T>>>;

    /// Dequeue, waiting until an entry arrives or `cancellation` fires.
    /// A cancelled wait returns `Ok(None)` promptly.
    async fn dequeue_cancellable(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Option<QueueEntry<T>>>;

    /// Mark a dequeued entry as successfully processed
    async fn complete(&self, entry: &QueueEntry<T>) -> Result<()>;

    /// Give a dequeued entry back for retry or dead-lettering
    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<()>;

    /// Extend the entry's visibility lease by another work-item timeout
    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<()>;

    /// Point-in-time statistics
    async fn stats(&self) -> Result<QueueStats>;

    /// Remove all state and reset every counter
    async fn delete_queue(&self) -> Result<()>;

    /// Count a consumer-side processing failure against this queue's stats
    fn record_error(&self);

    /// Attach a lifecycle behavior after construction
    fn attach_behavior(&self, behavior: Arc<dyn QueueBehavior<T>>);

    /// Stop accepting operations and wake any waiting dequeues
    fn close(&self);
}
