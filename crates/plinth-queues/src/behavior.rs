//! Queue lifecycle behaviors.
//!
//! Behaviors observe queue events to implement cross-cutting concerns.
//! `on_enqueuing` may veto the enqueue; all other hooks are observational.

use crate::entry::{QueueEntry, QueuePayload};
use crate::queue::EnqueueOptions;
use async_trait::async_trait;
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::Result;
use plinth_core::metrics::MetricsClient;
use std::marker::PhantomData;
use std::sync::Arc;

/// Observer of queue lifecycle events
#[async_trait]
pub trait QueueBehavior<T: QueuePayload>: Send + Sync {
    /// Invoked before an entry is accepted; returning `Ok(false)` vetoes the
    /// enqueue.
    async fn on_enqueuing(&self, _value: &T, _options: &EnqueueOptions) -> Result<bool> {
        Ok(true)
    }

    async fn on_enqueued(&self, _entry: &QueueEntry<T>) {}

    async fn on_dequeued(&self, _entry: &QueueEntry<T>) {}

    async fn on_lock_renewed(&self, _entry: &QueueEntry<T>) {}

    async fn on_completed(&self, _entry: &QueueEntry<T>) {}

    async fn on_abandoned(&self, _entry: &QueueEntry<T>) {}
}

/// Derives an optional metric subtype from a payload, e.g. a work item's
/// wire type name
pub type MetricSubtypeFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Emits counters and timers for queue events.
///
/// Names follow `{prefix}.{queue}.{subtype?}.{event}`: counters `enqueued`,
/// `dequeued`, `completed`, `abandoned`; timers `queuetime` (enqueue ->
/// dequeue) and `processtime` (dequeue -> complete/abandon). The subtype
/// segment appears only when a subtype extractor is configured and yields one
/// for the payload.
pub struct MetricsQueueBehavior<T> {
    metrics: Arc<dyn MetricsClient>,
    prefix: String,
    clock: Arc<dyn Clock>,
    subtype: Option<MetricSubtypeFn<T>>,
    _payload: PhantomData<fn(T)>,
}

impl<T> MetricsQueueBehavior<T> {
    pub fn new(metrics: Arc<dyn MetricsClient>, prefix: impl Into<String>, queue_name: &str) -> Self {
        Self {
            metrics,
            prefix: format!("{}.{}", prefix.into(), queue_name),
            clock: SystemClock::shared(),
            subtype: None,
            _payload: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Split metrics per payload subtype
    pub fn with_subtype<F>(mut self, subtype: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.subtype = Some(Arc::new(subtype));
        self
    }

    fn metric(&self, value: &T, event: &str) -> String {
        match self.subtype.as_ref().and_then(|f| f(value)) {
            Some(subtype) => format!("{}.{}.{}", self.prefix, subtype, event),
            None => format!("{}.{}", self.prefix, event),
        }
    }
}

#[async_trait]
impl<T: QueuePayload> QueueBehavior<T> for MetricsQueueBehavior<T> {
    async fn on_enqueued(&self, entry: &QueueEntry<T>) {
        self.metrics.counter(&self.metric(entry.value(), "enqueued"), 1);
    }

    async fn on_dequeued(&self, entry: &QueueEntry<T>) {
        self.metrics.counter(&self.metric(entry.value(), "dequeued"), 1);
        if let Some(dequeued_at) = entry.dequeued_at() {
            if let Ok(queue_time) = (dequeued_at - entry.enqueued_at()).to_std() {
                self.metrics
                    .timer(&self.metric(entry.value(), "queuetime"), queue_time);
            }
        }
    }

    async fn on_completed(&self, entry: &QueueEntry<T>) {
        self.metrics.counter(&self.metric(entry.value(), "completed"), 1);
        if let Some(dequeued_at) = entry.dequeued_at() {
            if let Ok(process_time) = (self.clock.utc_now() - dequeued_at).to_std() {
                self.metrics
                    .timer(&self.metric(entry.value(), "processtime"), process_time);
            }
        }
    }

    async fn on_abandoned(&self, entry: &QueueEntry<T>) {
        self.metrics.counter(&self.metric(entry.value(), "abandoned"), 1);
        if let Some(dequeued_at) = entry.dequeued_at() {
            if let Ok(process_time) = (self.clock.utc_now() - dequeued_at).to_std() {
                self.metrics
                    .timer(&self.metric(entry.value(), "processtime"), process_time);
            }
        }
    }
}

/// Logs queue events through tracing
pub struct LoggingQueueBehavior<T> {
    queue_name: String,
    _payload: PhantomData<fn(T)>,
}

impl<T> LoggingQueueBehavior<T> {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T: QueuePayload> QueueBehavior<T> for LoggingQueueBehavior<T> {
    async fn on_enqueued(&self, entry: &QueueEntry<T>) {
        tracing::debug!(queue = %self.queue_name, entry_id = entry.id(), "Entry enqueued");
    }

    async fn on_dequeued(&self, entry: &QueueEntry<T>) {
        tracing::debug!(
            queue = %self.queue_name,
            entry_id = entry.id(),
            attempts = entry.attempts(),
            "Entry dequeued"
        );
    }

    async fn on_lock_renewed(&self, entry: &QueueEntry<T>) {
        tracing::debug!(queue = %self.queue_name, entry_id = entry.id(), "Entry lock renewed");
    }

    async fn on_completed(&self, entry: &QueueEntry<T>) {
        tracing::debug!(queue = %self.queue_name, entry_id = entry.id(), "Entry completed");
    }

    async fn on_abandoned(&self, entry: &QueueEntry<T>) {
        tracing::warn!(
            queue = %self.queue_name,
            entry_id = entry.id(),
            attempts = entry.attempts(),
            "Entry abandoned"
        );
    }
}
