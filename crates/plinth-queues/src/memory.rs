//! In-memory queue implementation.
//!
//! Reference backend for tests and single-process deployments. A clock-driven
//! maintenance task sweeps expired visibility leases (auto-abandon) and moves
//! delayed retries back into the ready list.

use crate::behavior::QueueBehavior;
use crate::entry::{EntryOps, EntryState, QueueEntry, QueuePayload};
use crate::queue::{EnqueueOptions, Queue, QueueOptions, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use plinth_core::clock::Clock;
use plinth_core::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
struct EntryRecord<T> {
    id: String,
    correlation_id: Option<String>,
    properties: HashMap<String, String>,
    value: T,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
}

struct InFlight<T> {
    record: EntryRecord<T>,
    dequeued_at: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
}

struct Delayed<T> {
    record: EntryRecord<T>,
    visible_at: DateTime<Utc>,
}

/// Terminal entry retained in the dead-letter sub-queue
#[derive(Debug, Clone)]
pub struct DeadLetterEntry<T> {
    pub id: String,
    pub value: T,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Completed entry retained for inspection
#[derive(Debug, Clone)]
pub struct CompletedEntry<T> {
    pub id: String,
    pub value: T,
    pub completed_at: DateTime<Utc>,
}

struct QueueState<T> {
    ready: VecDeque<EntryRecord<T>>,
    delayed: Vec<Delayed<T>>,
    in_flight: HashMap<String, InFlight<T>>,
    dead_letter: VecDeque<DeadLetterEntry<T>>,
    completed: VecDeque<CompletedEntry<T>>,
    dedup: HashMap<String, (String, DateTime<Utc>)>,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: Vec::new(),
            in_flight: HashMap::new(),
            dead_letter: VecDeque::new(),
            completed: VecDeque::new(),
            dedup: HashMap::new(),
        }
    }

    fn clear(&mut self) {
        self.ready.clear();
        self.delayed.clear();
        self.in_flight.clear();
        self.dead_letter.clear();
        self.completed.clear();
        self.dedup.clear();
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.enqueued.store(0, Ordering::SeqCst);
        self.dequeued.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.abandoned.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.timeouts.store(0, Ordering::SeqCst);
    }
}

struct Inner<T: QueuePayload> {
    name: String,
    retries: u32,
    retry_delay: Duration,
    retry_multipliers: Vec<u32>,
    work_item_timeout: Duration,
    dead_letter_max_items: usize,
    completed_entry_retention_limit: usize,
    deduplication_window: Option<Duration>,
    clock: Arc<dyn Clock>,
    behaviors: RwLock<Vec<Arc<dyn QueueBehavior<T>>>>,
    state: Mutex<QueueState<T>>,
    counters: Counters,
    new_item: Notify,
    maintenance_wake: Notify,
    closed: CancellationToken,
    maintenance_started: AtomicBool,
    weak_self: Weak<Inner<T>>,
}

enum AbandonRoute {
    Requeued,
    Delayed(DateTime<Utc>),
    DeadLettered,
}

impl<T: QueuePayload> Inner<T> {
    /// Retry visibility delay for the given attempt number; the multiplier
    /// index saturates at the last table entry.
    fn retry_delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.retry_multipliers.is_empty() {
            return self.retry_delay;
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.retry_multipliers.len() - 1);
        self.retry_delay * self.retry_multipliers[index]
    }

    fn ops(&self) -> Arc<dyn EntryOps> {
        self.weak_self
            .upgrade()
            .expect("queue inner alive while in use")
    }

    fn make_entry(
        &self,
        record: &EntryRecord<T>,
        dequeued_at: Option<DateTime<Utc>>,
    ) -> QueueEntry<T> {
        QueueEntry::new(
            record.id.clone(),
            record.correlation_id.clone(),
            record.properties.clone(),
            record.value.clone(),
            record.enqueued_at,
            dequeued_at,
            record.attempts,
            self.ops(),
        )
    }

    fn behaviors_snapshot(&self) -> Vec<Arc<dyn QueueBehavior<T>>> {
        self.behaviors.read().clone()
    }

    /// Route an abandoned entry back to the ready list, the delayed list or
    /// the dead-letter sub-queue. Caller holds the state lock.
    fn route_abandoned(
        &self,
        state: &mut QueueState<T>,
        record: EntryRecord<T>,
        now: DateTime<Utc>,
    ) -> AbandonRoute {
        if record.attempts > self.retries {
            let dead = DeadLetterEntry {
                id: record.id,
                value: record.value,
                attempts: record.attempts,
                dead_lettered_at: now,
            };
            state.dead_letter.push_back(dead);
            while state.dead_letter.len() > self.dead_letter_max_items {
                state.dead_letter.pop_front();
            }
            return AbandonRoute::DeadLettered;
        }

        let delay = self.retry_delay_for_attempt(record.attempts);
        if delay.is_zero() {
            state.ready.push_back(record);
            AbandonRoute::Requeued
        } else {
            let visible_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            state.delayed.push(Delayed { record, visible_at });
            AbandonRoute::Delayed(visible_at)
        }
    }

    fn try_dequeue_one(&self) -> Option<QueueEntry<T>> {
        let now = self.clock.utc_now();
        let entry = {
            let mut state = self.state.lock();
            let mut record = state.ready.pop_front()?;
            record.attempts += 1;

            let in_flight = InFlight {
                record: record.clone(),
                dequeued_at: now,
                lease_expires_at: now
                    + chrono::Duration::from_std(self.work_item_timeout).unwrap_or_default(),
            };
            state.in_flight.insert(record.id.clone(), in_flight);
            self.make_entry(&record, Some(now))
        };

        self.counters.dequeued.fetch_add(1, Ordering::SeqCst);
        // The lease gives the sweep a new wake-up deadline.
        self.maintenance_wake.notify_one();
        Some(entry)
    }

    async fn complete_impl(&self, id: &str) -> Result<()> {
        let now = self.clock.utc_now();
        let in_flight = {
            let mut state = self.state.lock();
            let in_flight = state.in_flight.remove(id).ok_or_else(|| {
                Error::invalid_state(format!(
                    "entry {} is not currently dequeued (already completed, abandoned, or lease expired)",
                    id
                ))
            })?;

            if self.completed_entry_retention_limit > 0 {
                state.completed.push_back(CompletedEntry {
                    id: in_flight.record.id.clone(),
                    value: in_flight.record.value.clone(),
                    completed_at: now,
                });
                while state.completed.len() > self.completed_entry_retention_limit {
                    state.completed.pop_front();
                }
            }
            in_flight
        };

        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        let entry = self.make_entry(&in_flight.record, Some(in_flight.dequeued_at));
        for behavior in self.behaviors_snapshot() {
            behavior.on_completed(&entry).await;
        }
        Ok(())
    }

    async fn abandon_impl(&self, id: &str) -> Result<()> {
        let now = self.clock.utc_now();
        let (in_flight, route) = {
            let mut state = self.state.lock();
            let in_flight = state.in_flight.remove(id).ok_or_else(|| {
                Error::invalid_state(format!(
                    "entry {} is not currently dequeued (already completed, abandoned, or lease expired)",
                    id
                ))
            })?;

            let route = self.route_abandoned(&mut state, in_flight.record.clone(), now);
            (in_flight, route)
        };

        self.counters.abandoned.fetch_add(1, Ordering::SeqCst);
        match route {
            AbandonRoute::Requeued => self.new_item.notify_one(),
            AbandonRoute::Delayed(_) => self.maintenance_wake.notify_one(),
            AbandonRoute::DeadLettered => {
                tracing::warn!(
                    queue = %self.name,
                    entry_id = id,
                    attempts = in_flight.record.attempts,
                    "Entry moved to dead letter"
                );
            }
        }

        let entry = self.make_entry(&in_flight.record, Some(in_flight.dequeued_at));
        for behavior in self.behaviors_snapshot() {
            behavior.on_abandoned(&entry).await;
        }
        Ok(())
    }

    async fn renew_lock_impl(&self, id: &str) -> Result<()> {
        let now = self.clock.utc_now();
        let renewed = {
            let mut state = self.state.lock();
            match state.in_flight.get_mut(id) {
                Some(in_flight) => {
                    in_flight.lease_expires_at = now
                        + chrono::Duration::from_std(self.work_item_timeout).unwrap_or_default();
                    Some(self.make_entry(&in_flight.record, Some(in_flight.dequeued_at)))
                }
                // Entry already terminal or requeued: renewal is a no-op.
                None => None,
            }
        };

        if let Some(entry) = renewed {
            for behavior in self.behaviors_snapshot() {
                behavior.on_lock_renewed(&entry).await;
            }
        }
        Ok(())
    }

    /// One maintenance pass: move due delayed retries to the ready list and
    /// auto-abandon expired visibility leases. Returns entries the sweep
    /// abandoned, for behavior notification outside the lock.
    fn sweep(&self, now: DateTime<Utc>) -> Vec<QueueEntry<T>> {
        let mut requeued = 0usize;
        let mut abandoned = Vec::new();

        {
            let mut state = self.state.lock();

            let mut i = 0;
            while i < state.delayed.len() {
                if state.delayed[i].visible_at <= now {
                    let delayed = state.delayed.swap_remove(i);
                    state.ready.push_back(delayed.record);
                    requeued += 1;
                } else {
                    i += 1;
                }
            }

            let expired: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, f)| f.lease_expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();

            for id in expired {
                let Some(in_flight) = state.in_flight.remove(&id) else {
                    continue;
                };
                self.counters.timeouts.fetch_add(1, Ordering::SeqCst);
                self.counters.abandoned.fetch_add(1, Ordering::SeqCst);
                let entry = self.make_entry(&in_flight.record, Some(in_flight.dequeued_at));
                match self.route_abandoned(&mut state, in_flight.record, now) {
                    AbandonRoute::Requeued => requeued += 1,
                    AbandonRoute::Delayed(_) | AbandonRoute::DeadLettered => {}
                }
                tracing::warn!(
                    queue = %self.name,
                    entry_id = entry.id(),
                    "Visibility lease expired; entry auto-abandoned"
                );
                abandoned.push(entry);
            }

            state.dedup.retain(|_, (_, expires)| *expires > now);
        }

        for _ in 0..requeued {
            self.new_item.notify_one();
        }
        abandoned
    }

    /// Earliest instant the sweep has work to do
    fn next_due(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        let lease = state.in_flight.values().map(|f| f.lease_expires_at).min();
        let visible = state.delayed.iter().map(|d| d.visible_at).min();
        match (lease, visible) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[async_trait]
impl<T: QueuePayload> EntryOps for Inner<T> {
    async fn complete_entry(&self, id: &str) -> Result<()> {
        self.complete_impl(id).await
    }

    async fn abandon_entry(&self, id: &str) -> Result<()> {
        self.abandon_impl(id).await
    }

    async fn renew_entry_lock(&self, id: &str) -> Result<()> {
        self.renew_lock_impl(id).await
    }
}

/// In-memory queue
pub struct InMemoryQueue<T: QueuePayload> {
    inner: Arc<Inner<T>>,
}

impl<T: QueuePayload> InMemoryQueue<T> {
    pub fn new(options: QueueOptions<T>) -> Self {
        let behaviors = options.behaviors.clone();
        let inner = Arc::new_cyclic(|weak| Inner {
            name: options.name.clone(),
            retries: options.retries,
            retry_delay: options.retry_delay,
            retry_multipliers: options.retry_multipliers.clone(),
            work_item_timeout: options.work_item_timeout,
            dead_letter_max_items: options.dead_letter_max_items.max(1),
            completed_entry_retention_limit: options.completed_entry_retention_limit,
            deduplication_window: options.deduplication_window,
            clock: options.clock.clone(),
            behaviors: RwLock::new(behaviors),
            state: Mutex::new(QueueState::new()),
            counters: Counters::default(),
            new_item: Notify::new(),
            maintenance_wake: Notify::new(),
            closed: CancellationToken::new(),
            maintenance_started: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    /// Spawn the maintenance sweep on first use
    fn ensure_maintenance(&self) {
        if self
            .inner
            .maintenance_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                if inner.closed.is_cancelled() {
                    break;
                }

                let now = inner.clock.utc_now();
                let abandoned = inner.sweep(now);
                for entry in &abandoned {
                    for behavior in inner.behaviors_snapshot() {
                        behavior.on_abandoned(entry).await;
                    }
                }

                let now = inner.clock.utc_now();
                let sleep_for = match inner.next_due() {
                    Some(due) if due > now => (due - now).to_std().unwrap_or(Duration::ZERO),
                    Some(_) => Duration::from_millis(5),
                    None => Duration::from_millis(500),
                };

                tokio::select! {
                    _ = inner.closed.cancelled() => break,
                    _ = inner.maintenance_wake.notified() => {}
                    _ = inner.clock.sleep(sleep_for) => {}
                }
            }
        });
    }

    async fn dequeue_inner(
        &self,
        deadline: Option<DateTime<Utc>>,
        cancellation: CancellationToken,
    ) -> Result<Option<QueueEntry<T>>> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::closed(format!("queue {}", self.inner.name)));
        }
        self.ensure_maintenance();

        loop {
            let notified = self.inner.new_item.notified();

            if let Some(entry) = self.inner.try_dequeue_one() {
                for behavior in self.inner.behaviors_snapshot() {
                    behavior.on_dequeued(&entry).await;
                }
                return Ok(Some(entry));
            }

            let now = self.inner.clock.utc_now();
            let remaining = match deadline {
                Some(deadline) if deadline <= now => return Ok(None),
                Some(deadline) => Some((deadline - now).to_std().unwrap_or(Duration::ZERO)),
                None => None,
            };

            match remaining {
                Some(remaining) => {
                    tokio::select! {
                        _ = self.inner.closed.cancelled() => return Ok(None),
                        _ = cancellation.cancelled() => return Ok(None),
                        _ = notified => {}
                        _ = self.inner.clock.sleep(remaining) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.inner.closed.cancelled() => return Ok(None),
                        _ = cancellation.cancelled() => return Ok(None),
                        _ = notified => {}
                    }
                }
            }
        }
    }

    /// Current lifecycle state of an entry, while the queue still tracks it.
    /// Completed entries are only visible when a retention limit is set.
    pub fn entry_state(&self, id: &str) -> Option<EntryState> {
        let state = self.inner.state.lock();
        if state.in_flight.contains_key(id) {
            return Some(EntryState::Dequeued);
        }
        if state.ready.iter().any(|r| r.id == id)
            || state.delayed.iter().any(|d| d.record.id == id)
        {
            return Some(EntryState::Queued);
        }
        if state.dead_letter.iter().any(|d| d.id == id) {
            return Some(EntryState::DeadLetter);
        }
        if state.completed.iter().any(|c| c.id == id) {
            return Some(EntryState::Completed);
        }
        None
    }

    /// Entries currently retained in the dead-letter sub-queue
    pub fn dead_letter_entries(&self) -> Vec<DeadLetterEntry<T>> {
        self.inner.state.lock().dead_letter.iter().cloned().collect()
    }

    /// Completed entries retained for inspection
    pub fn completed_entries(&self) -> Vec<CompletedEntry<T>> {
        self.inner.state.lock().completed.iter().cloned().collect()
    }
}

#[async_trait]
impl<T: QueuePayload> Queue<T> for InMemoryQueue<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn enqueue_with_options(&self, value: T, options: EnqueueOptions) -> Result<String> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::closed(format!("queue {}", self.inner.name)));
        }
        self.ensure_maintenance();

        for behavior in self.inner.behaviors_snapshot() {
            if !behavior.on_enqueuing(&value, &options).await? {
                return Err(Error::invalid_state("enqueue vetoed by queue behavior"));
            }
        }

        let now = self.inner.clock.utc_now();
        let id = Uuid::new_v4().to_string();

        let record = EntryRecord {
            id: id.clone(),
            correlation_id: options.correlation_id,
            properties: options.properties,
            value,
            enqueued_at: now,
            attempts: 0,
        };

        let entry = {
            let mut state = self.inner.state.lock();

            if let (Some(window), Some(dedup_id)) =
                (self.inner.deduplication_window, options.deduplication_id)
            {
                if let Some((existing_id, expires)) = state.dedup.get(&dedup_id) {
                    if *expires > now {
                        let existing_id = existing_id.clone();
                        tracing::debug!(
                            queue = %self.inner.name,
                            dedup_id = %dedup_id,
                            "Duplicate enqueue discarded inside deduplication window"
                        );
                        return Ok(existing_id);
                    }
                }
                let expires = now + chrono::Duration::from_std(window).unwrap_or_default();
                state.dedup.insert(dedup_id, (id.clone(), expires));
            }

            let entry = self.inner.make_entry(&record, None);
            state.ready.push_back(record);
            entry
        };

        self.inner.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        self.inner.new_item.notify_one();

        for behavior in self.inner.behaviors_snapshot() {
            behavior.on_enqueued(&entry).await;
        }
        Ok(id)
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<QueueEntry<T>>> {
        let deadline = match timeout {
            Some(timeout) if !timeout.is_zero() => Some(
                self.inner.clock.utc_now()
                    + chrono::Duration::from_std(timeout).unwrap_or_default(),
            ),
            // Zero or no timeout: a single visibility check.
            _ => Some(self.inner.clock.utc_now()),
        };
        self.dequeue_inner(deadline, CancellationToken::new()).await
    }

    async fn dequeue_cancellable(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Option<QueueEntry<T>>> {
        self.dequeue_inner(None, cancellation).await
    }

    async fn complete(&self, entry: &QueueEntry<T>) -> Result<()> {
        entry.complete().await
    }

    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<()> {
        entry.abandon().await
    }

    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<()> {
        entry.renew_lock().await
    }

    async fn stats(&self) -> Result<QueueStats> {
        let (queued, working, deadletter) = {
            let state = self.inner.state.lock();
            (
                (state.ready.len() + state.delayed.len()) as u64,
                state.in_flight.len() as u64,
                state.dead_letter.len() as u64,
            )
        };

        let counters = &self.inner.counters;
        Ok(QueueStats {
            queued,
            working,
            deadletter,
            enqueued: counters.enqueued.load(Ordering::SeqCst),
            dequeued: counters.dequeued.load(Ordering::SeqCst),
            completed: counters.completed.load(Ordering::SeqCst),
            abandoned: counters.abandoned.load(Ordering::SeqCst),
            errors: counters.errors.load(Ordering::SeqCst),
            timeouts: counters.timeouts.load(Ordering::SeqCst),
        })
    }

    async fn delete_queue(&self) -> Result<()> {
        self.inner.state.lock().clear();
        self.inner.counters.reset();
        tracing::debug!(queue = %self.inner.name, "Queue deleted");
        Ok(())
    }

    fn record_error(&self) {
        self.inner.counters.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn attach_behavior(&self, behavior: Arc<dyn QueueBehavior<T>>) {
        self.inner.behaviors.write().push(behavior);
    }

    fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        self.inner.new_item.notify_waiters();
        self.inner.maintenance_wake.notify_waiters();
        tracing::debug!(queue = %self.inner.name, "Queue closed");
    }
}

impl<T: QueuePayload> Drop for InMemoryQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}
