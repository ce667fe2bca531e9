//! Queue consumer loop.
//!
//! `start_working` spawns a loop that dequeues entries and hands them to a
//! handler. With auto-complete on, the loop completes entries the handler
//! returns `Ok` for; handler failures and panics always abandon. An
//! `InvalidState` from a late complete/abandon (the maintenance sweep got
//! there first) is logged and the loop moves on.

use crate::entry::{QueueEntry, QueuePayload};
use crate::queue::Queue;
use futures::future::BoxFuture;
use futures::FutureExt;
use plinth_core::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Boxed queue entry handler
pub type QueueEntryHandlerFn<T> =
    Arc<dyn Fn(QueueEntry<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`QueueEntryHandlerFn`]
pub fn handler_fn<T, F, Fut>(f: F) -> QueueEntryHandlerFn<T>
where
    T: QueuePayload,
    F: Fn(QueueEntry<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |entry| f(entry).boxed())
}

/// Handle to a running consumer loop
pub struct WorkerHandle {
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the loop to stop after its in-flight entry
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop_and_join(self) {
        self.cancellation.cancel();
        let _ = self.task.await;
    }
}

/// Spawn a consumer loop over `queue`.
///
/// Backend dequeue errors are counted against the queue's stats and retried
/// after an exponential backoff with jitter; the loop exits when stopped or
/// when the queue closes.
pub fn start_working<T: QueuePayload>(
    queue: Arc<dyn Queue<T>>,
    handler: QueueEntryHandlerFn<T>,
    auto_complete: bool,
) -> WorkerHandle {
    let cancellation = CancellationToken::new();
    let token = cancellation.clone();

    let task = tokio::spawn(async move {
        let mut error_backoff = Duration::from_millis(50);

        loop {
            if token.is_cancelled() {
                break;
            }

            match queue.dequeue_cancellable(token.child_token()).await {
                Ok(Some(entry)) => {
                    error_backoff = Duration::from_millis(50);
                    process_entry(queue.as_ref(), entry, &handler, auto_complete).await;
                }
                // A `None` from a cancellable dequeue means our token fired or
                // the queue closed under us; either way the loop is done.
                Ok(None) => break,
                Err(error) => {
                    if matches!(error, Error::Closed { .. }) {
                        break;
                    }

                    queue.record_error();
                    tracing::error!(
                        queue = queue.name(),
                        %error,
                        backoff_ms = error_backoff.as_millis() as u64,
                        "Dequeue failed; backing off"
                    );

                    let jitter =
                        rand::thread_rng().gen_range(0..=error_backoff.as_millis() as u64 / 2);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff + Duration::from_millis(jitter)) => {}
                    }
                    error_backoff = (error_backoff * 2).min(Duration::from_secs(5));
                }
            }
        }

        tracing::debug!(queue = queue.name(), "Queue worker stopped");
    });

    WorkerHandle { cancellation, task }
}

async fn process_entry<T: QueuePayload>(
    queue: &dyn Queue<T>,
    entry: QueueEntry<T>,
    handler: &QueueEntryHandlerFn<T>,
    auto_complete: bool,
) {
    let outcome = std::panic::AssertUnwindSafe(handler(entry.clone()))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            if auto_complete && !entry.is_finished() {
                if let Err(error) = entry.complete().await {
                    if error.is_invalid_state() {
                        // The visibility sweep auto-abandoned this entry while
                        // the handler ran; it will be retried.
                        tracing::warn!(
                            queue = queue.name(),
                            entry_id = entry.id(),
                            "Entry was auto-abandoned before completion"
                        );
                    } else {
                        tracing::error!(
                            queue = queue.name(),
                            entry_id = entry.id(),
                            %error,
                            "Failed to complete queue entry"
                        );
                    }
                }
            }
        }
        Ok(Err(error)) => {
            queue.record_error();
            tracing::error!(
                queue = queue.name(),
                entry_id = entry.id(),
                %error,
                "Queue entry handler failed"
            );
            abandon_quietly(queue, &entry).await;
        }
        Err(_) => {
            queue.record_error();
            tracing::error!(
                queue = queue.name(),
                entry_id = entry.id(),
                "Queue entry handler panicked"
            );
            abandon_quietly(queue, &entry).await;
        }
    }
}

async fn abandon_quietly<T: QueuePayload>(queue: &dyn Queue<T>, entry: &QueueEntry<T>) {
    if entry.is_finished() {
        return;
    }
    if let Err(error) = entry.abandon().await {
        if error.is_invalid_state() {
            tracing::warn!(
                queue = queue.name(),
                entry_id = entry.id(),
                "Entry was already auto-abandoned"
            );
        } else {
            tracing::error!(
                queue = queue.name(),
                entry_id = entry.id(),
                %error,
                "Failed to abandon queue entry"
            );
        }
    }
}
