//! Queue-consumer job: dequeue, process, complete/abandon as one job
//! iteration, with optional per-entry locking.

use crate::job::{Job, JobContext, JobResult};
use async_trait::async_trait;
use futures::FutureExt;
use plinth_core::error::Result;
use plinth_locks::{LockProvider, LockProviderExt};
use plinth_queues::{Queue, QueueEntry, QueuePayload};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Processes one dequeued entry
#[async_trait]
pub trait QueueEntryProcessor: Send + Sync {
    type Payload: QueuePayload;

    async fn process(&self, context: &QueueEntryContext<Self::Payload>) -> Result<()>;
}

/// Context handed to [`QueueEntryProcessor::process`]
pub struct QueueEntryContext<T> {
    entry: QueueEntry<T>,
    cancellation: CancellationToken,
}

impl<T: QueuePayload> QueueEntryContext<T> {
    pub fn new(entry: QueueEntry<T>, cancellation: CancellationToken) -> Self {
        Self {
            entry,
            cancellation,
        }
    }

    pub fn entry(&self) -> &QueueEntry<T> {
        &self.entry
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Complete the entry early, overriding auto-complete
    pub async fn complete(&self) -> Result<()> {
        self.entry.complete().await
    }

    /// Abandon the entry early, overriding auto-complete
    pub async fn abandon(&self) -> Result<()> {
        self.entry.abandon().await
    }

    /// Extend the visibility lease for long-running processing
    pub async fn renew_lock(&self) -> Result<()> {
        self.entry.renew_lock().await
    }
}

/// Queue-job configuration
#[derive(Clone)]
pub struct QueueJobOptions {
    /// How long one iteration waits for an entry
    pub dequeue_timeout: Duration,
    /// Complete on processor success, abandon on failure, unless the
    /// processor already resolved the entry
    pub auto_complete: bool,
    /// When set, an exclusive per-entry lock is taken before processing;
    /// losing the race abandons the entry for another worker
    pub entry_lock_provider: Option<Arc<dyn LockProvider>>,
    pub entry_lock_timeout: Option<Duration>,
}

impl Default for QueueJobOptions {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(30),
            auto_complete: true,
            entry_lock_provider: None,
            entry_lock_timeout: None,
        }
    }
}

/// A [`Job`] that consumes one queue entry per iteration
pub struct QueueJob<P: QueueEntryProcessor> {
    name: String,
    queue: Arc<dyn Queue<P::Payload>>,
    processor: P,
    options: QueueJobOptions,
}

impl<P: QueueEntryProcessor> QueueJob<P> {
    pub fn new(queue: Arc<dyn Queue<P::Payload>>, processor: P) -> Self {
        Self {
            name: format!("{}-queue-job", queue.name()),
            queue,
            processor,
            options: QueueJobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueueJobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue(&self) -> &Arc<dyn Queue<P::Payload>> {
        &self.queue
    }

    async fn abandon_tolerant(&self, entry: &QueueEntry<P::Payload>) {
        if entry.is_finished() {
            return;
        }
        if let Err(error) = entry.abandon().await {
            if error.is_invalid_state() {
                tracing::warn!(
                    job = %self.name,
                    entry_id = entry.id(),
                    "Entry was already resolved when abandoning"
                );
            } else {
                tracing::error!(
                    job = %self.name,
                    entry_id = entry.id(),
                    %error,
                    "Failed to abandon entry"
                );
            }
        }
    }
}

#[async_trait]
impl<P: QueueEntryProcessor> Job for QueueJob<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &JobContext) -> JobResult {
        if context.is_cancelled() {
            return JobResult::cancelled();
        }

        let dequeued = tokio::select! {
            biased;
            dequeued = self.queue.dequeue(Some(self.options.dequeue_timeout)) => dequeued,
            _ = context.cancellation().cancelled() => return JobResult::cancelled(),
        };

        let entry = match dequeued {
            Ok(Some(entry)) => entry,
            Ok(None) => return JobResult::success_with("no queue entry available"),
            Err(error) => return JobResult::from_error(error),
        };

        // Cancellation landed between the dequeue and here: hand the entry
        // back instead of starting work that would be torn down.
        if context.is_cancelled() {
            self.abandon_tolerant(&entry).await;
            return JobResult::cancelled_with("cancellation requested before processing");
        }

        let entry_lock = match &self.options.entry_lock_provider {
            Some(provider) => {
                let resource = format!("{}:{}", self.queue.name(), entry.id());
                match provider
                    .acquire(
                        &resource,
                        self.options.entry_lock_timeout,
                        Some(Duration::from_secs(1)),
                    )
                    .await
                {
                    Ok(Some(lock)) => Some(lock),
                    // Another worker owns this entry; hand it back.
                    Ok(None) => {
                        self.abandon_tolerant(&entry).await;
                        return JobResult::success_with("failed to acquire entry lock");
                    }
                    Err(error) => {
                        self.abandon_tolerant(&entry).await;
                        return JobResult::from_error(error);
                    }
                }
            }
            None => None,
        };

        let entry_context =
            QueueEntryContext::new(entry.clone(), context.cancellation().clone());
        let outcome = std::panic::AssertUnwindSafe(self.processor.process(&entry_context))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(())) => {
                if self.options.auto_complete && !entry.is_finished() {
                    match entry.complete().await {
                        Ok(()) => JobResult::success(),
                        Err(error) if error.is_invalid_state() => {
                            // The visibility sweep already reclaimed the entry
                            // while the processor ran; the iteration still
                            // ends cleanly.
                            tracing::warn!(
                                job = %self.name,
                                entry_id = entry.id(),
                                "Entry was auto-abandoned before completion"
                            );
                            JobResult::success_with("entry was auto-abandoned before completion")
                        }
                        Err(error) => JobResult::from_error(error),
                    }
                } else {
                    JobResult::success()
                }
            }
            Ok(Err(error)) => {
                self.queue.record_error();
                tracing::error!(
                    job = %self.name,
                    entry_id = entry.id(),
                    %error,
                    "Queue entry processing failed"
                );
                self.abandon_tolerant(&entry).await;
                JobResult::from_error(error)
            }
            Err(_) => {
                self.queue.record_error();
                tracing::error!(
                    job = %self.name,
                    entry_id = entry.id(),
                    "Queue entry processor panicked"
                );
                self.abandon_tolerant(&entry).await;
                JobResult::failure("queue entry processor panicked")
            }
        };

        if let Some(lock) = entry_lock {
            if let Err(error) = lock.release().await {
                tracing::error!(job = %self.name, %error, "Failed to release entry lock");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_cache::InMemoryCacheBackend;
    use plinth_core::error::Error;
    use plinth_locks::CacheLockProvider;
    use plinth_queues::{InMemoryQueue, QueueOptions};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        action: String,
    }

    struct TaskProcessor {
        processed: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl QueueEntryProcessor for TaskProcessor {
        type Payload = Task;

        async fn process(&self, context: &QueueEntryContext<Task>) -> Result<()> {
            if self.fail {
                return Err(Error::handler(format!(
                    "cannot run {}",
                    context.entry().value().action
                )));
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn task_queue(options: QueueOptions<Task>) -> Arc<dyn Queue<Task>> {
        Arc::new(InMemoryQueue::new(options))
    }

    fn fast_options() -> QueueJobOptions {
        QueueJobOptions {
            dequeue_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_processes_and_completes() {
        let queue = task_queue(QueueOptions::named("tasks"));
        let processed = Arc::new(AtomicU32::new(0));

        queue
            .enqueue(Task {
                action: "build".into(),
            })
            .await
            .unwrap();

        let job = QueueJob::new(
            queue.clone(),
            TaskProcessor {
                processed: processed.clone(),
                fail: false,
            },
        )
        .with_options(fast_options());

        let result = job.run(&JobContext::new(CancellationToken::new())).await;
        assert!(result.is_success());
        assert_eq!(processed.load(Ordering::SeqCst), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.working, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_soft_success() {
        let queue = task_queue(QueueOptions::named("empty"));
        let job = QueueJob::new(
            queue,
            TaskProcessor {
                processed: Arc::new(AtomicU32::new(0)),
                fail: false,
            },
        )
        .with_options(fast_options());

        let result = job.run(&JobContext::new(CancellationToken::new())).await;
        assert!(result.is_success());
        assert_eq!(result.message(), Some("no queue entry available"));
    }

    #[tokio::test]
    async fn test_processor_failure_abandons_and_fails() {
        let queue = task_queue(
            QueueOptions::named("failing")
                .with_retries(0)
                .with_retry_delay(Duration::ZERO),
        );

        queue
            .enqueue(Task {
                action: "explode".into(),
            })
            .await
            .unwrap();

        let job = QueueJob::new(
            queue.clone(),
            TaskProcessor {
                processed: Arc::new(AtomicU32::new(0)),
                fail: true,
            },
        )
        .with_options(fast_options());

        let result = job.run(&JobContext::new(CancellationToken::new())).await;
        assert!(result.is_failure(), "processor error surfaces to the runner");

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.deadletter, 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_skips_dequeue() {
        let queue = task_queue(QueueOptions::named("pre-cancelled"));
        queue
            .enqueue(Task {
                action: "later".into(),
            })
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let job = QueueJob::new(
            queue.clone(),
            TaskProcessor {
                processed: Arc::new(AtomicU32::new(0)),
                fail: false,
            },
        )
        .with_options(fast_options());

        let result = job.run(&JobContext::new(token)).await;
        assert!(result.is_cancelled());
        assert_eq!(queue.stats().await.unwrap().queued, 1, "entry untouched");
    }

    /// Queue wrapper that cancels a token the moment an entry is handed out,
    /// pinning down the dequeue-then-cancelled window.
    struct CancelOnDequeue {
        inner: Arc<dyn Queue<Task>>,
        token: CancellationToken,
    }

    #[async_trait]
    impl Queue<Task> for CancelOnDequeue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue_with_options(
            &self,
            value: Task,
            options: plinth_queues::EnqueueOptions,
        ) -> Result<String> {
            self.inner.enqueue_with_options(value, options).await
        }

        async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<QueueEntry<Task>>> {
            let entry = self.inner.dequeue(timeout).await?;
            if entry.is_some() {
                self.token.cancel();
            }
            Ok(entry)
        }

        async fn dequeue_cancellable(
            &self,
            cancellation: CancellationToken,
        ) -> Result<Option<QueueEntry<Task>>> {
            self.inner.dequeue_cancellable(cancellation).await
        }

        async fn complete(&self, entry: &QueueEntry<Task>) -> Result<()> {
            self.inner.complete(entry).await
        }

        async fn abandon(&self, entry: &QueueEntry<Task>) -> Result<()> {
            self.inner.abandon(entry).await
        }

        async fn renew_lock(&self, entry: &QueueEntry<Task>) -> Result<()> {
            self.inner.renew_lock(entry).await
        }

        async fn stats(&self) -> Result<plinth_queues::QueueStats> {
            self.inner.stats().await
        }

        async fn delete_queue(&self) -> Result<()> {
            self.inner.delete_queue().await
        }

        fn record_error(&self) {
            self.inner.record_error();
        }

        fn attach_behavior(&self, behavior: Arc<dyn plinth_queues::QueueBehavior<Task>>) {
            self.inner.attach_behavior(behavior);
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    #[tokio::test]
    async fn test_cancellation_after_dequeue_abandons_entry() {
        let inner = task_queue(QueueOptions::named("mid-cancel").with_retry_delay(Duration::ZERO));
        inner
            .enqueue(Task {
                action: "caught".into(),
            })
            .await
            .unwrap();

        let token = CancellationToken::new();
        let queue: Arc<dyn Queue<Task>> = Arc::new(CancelOnDequeue {
            inner: inner.clone(),
            token: token.clone(),
        });

        let processed = Arc::new(AtomicU32::new(0));
        let job = QueueJob::new(
            queue,
            TaskProcessor {
                processed: processed.clone(),
                fail: false,
            },
        )
        .with_options(fast_options());

        let result = job.run(&JobContext::new(token)).await;
        assert!(result.is_cancelled());
        assert_eq!(processed.load(Ordering::SeqCst), 0, "processor never invoked");

        let stats = inner.stats().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.queued, 1, "entry handed back for retry");
    }

    #[tokio::test]
    async fn test_entry_lock_contention_is_soft_skip() {
        let queue = task_queue(QueueOptions::named("locked").with_retry_delay(Duration::ZERO));
        let id = queue
            .enqueue(Task {
                action: "guarded".into(),
            })
            .await
            .unwrap();

        let provider: Arc<dyn LockProvider> =
            Arc::new(CacheLockProvider::new(Arc::new(InMemoryCacheBackend::new())));

        // Another worker already holds this entry's lock.
        let held = provider
            .acquire(
                &format!("locked:{}", id),
                None,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap()
            .unwrap();

        let processed = Arc::new(AtomicU32::new(0));
        let job = QueueJob::new(
            queue.clone(),
            TaskProcessor {
                processed: processed.clone(),
                fail: false,
            },
        )
        .with_options(QueueJobOptions {
            dequeue_timeout: Duration::from_millis(50),
            entry_lock_provider: Some(provider),
            ..Default::default()
        });

        let result = job.run(&JobContext::new(CancellationToken::new())).await;
        assert!(result.is_success());
        assert_eq!(result.message(), Some("failed to acquire entry lock"));
        assert_eq!(processed.load(Ordering::SeqCst), 0);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.abandoned, 1, "entry handed back for another worker");

        held.release().await.unwrap();
    }
}
