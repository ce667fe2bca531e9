//! Queue entries and their lifecycle state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plinth_core::error::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Bound for values that can travel through a queue
pub trait QueuePayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> QueuePayload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Lifecycle state of a queue entry.
///
/// `Queued -> Dequeued -> (Completed | Abandoned)`; an abandoned entry either
/// returns to `Queued` (retry budget left) or moves to `DeadLetter`.
/// `Completed` and `DeadLetter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Queued,
    Dequeued,
    Completed,
    Abandoned,
    DeadLetter,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryState::Queued => "queued",
            EntryState::Dequeued => "dequeued",
            EntryState::Completed => "completed",
            EntryState::Abandoned => "abandoned",
            EntryState::DeadLetter => "dead_letter",
        };
        write!(f, "{}", s)
    }
}

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const ABANDONED: u8 = 2;

/// Queue-side operations an entry delegates to.
///
/// The entry carries only its id; per-entry state stays owned by the queue.
#[async_trait]
pub(crate) trait EntryOps: Send + Sync {
    async fn complete_entry(&self, id: &str) -> Result<()>;
    async fn abandon_entry(&self, id: &str) -> Result<()>;
    async fn renew_entry_lock(&self, id: &str) -> Result<()>;
}

/// A dequeued (or lifecycle-hook) view of a queue entry.
///
/// Clones share the completion flag, so `complete`/`abandon` act at most once
/// per dequeue no matter which clone is used.
pub struct QueueEntry<T> {
    id: String,
    correlation_id: Option<String>,
    properties: HashMap<String, String>,
    value: T,
    enqueued_at: DateTime<Utc>,
    dequeued_at: Option<DateTime<Utc>>,
    attempts: u32,
    completion: Arc<AtomicU8>,
    ops: Arc<dyn EntryOps>,
}

impl<T> std::fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("attempts", &self.attempts)
            .field("enqueued_at", &self.enqueued_at)
            .field("dequeued_at", &self.dequeued_at)
            .finish()
    }
}

impl<T: Clone> Clone for QueueEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            properties: self.properties.clone(),
            value: self.value.clone(),
            enqueued_at: self.enqueued_at,
            dequeued_at: self.dequeued_at,
            attempts: self.attempts,
            completion: self.completion.clone(),
            ops: self.ops.clone(),
        }
    }
}

impl<T> QueueEntry<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        correlation_id: Option<String>,
        properties: HashMap<String, String>,
        value: T,
        enqueued_at: DateTime<Utc>,
        dequeued_at: Option<DateTime<Utc>>,
        attempts: u32,
        ops: Arc<dyn EntryOps>,
    ) -> Self {
        Self {
            id,
            correlation_id,
            properties,
            value,
            enqueued_at,
            dequeued_at,
            attempts,
            completion: Arc::new(AtomicU8::new(PENDING)),
            ops,
        }
    }

    /// Unique id assigned at enqueue
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Correlation id preserved end to end
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Free-form metadata attached at enqueue
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// The payload
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// When this entry was handed to the current consumer
    pub fn dequeued_at(&self) -> Option<DateTime<Utc>> {
        self.dequeued_at
    }

    /// Times this entry has been handed to a consumer; 1 on the first dequeue
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether this handle already completed or abandoned the entry
    pub fn is_finished(&self) -> bool {
        self.completion.load(Ordering::SeqCst) != PENDING
    }

    /// Mark the entry as successfully processed.
    ///
    /// Fails with `InvalidState` when the entry was already completed,
    /// abandoned, or auto-abandoned by the visibility sweep.
    pub async fn complete(&self) -> Result<()> {
        self.ops.complete_entry(&self.id).await?;
        self.completion.store(COMPLETED, Ordering::SeqCst);
        Ok(())
    }

    /// Give the entry back to the queue; it is retried or dead-lettered
    /// depending on the remaining retry budget.
    pub async fn abandon(&self) -> Result<()> {
        self.ops.abandon_entry(&self.id).await?;
        self.completion.store(ABANDONED, Ordering::SeqCst);
        Ok(())
    }

    /// Extend the visibility lease by another work-item timeout from now
    pub async fn renew_lock(&self) -> Result<()> {
        self.ops.renew_entry_lock(&self.id).await
    }
}
