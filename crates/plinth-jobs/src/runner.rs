//! Job runner: one-shot, continuous, interval and multi-instance execution
//! with optional distributed locking.

use crate::job::{Job, JobContext, JobResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use plinth_core::clock::{Clock, SystemClock};
use plinth_locks::{LockProvider, LockProviderExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Predicate evaluated between continuous iterations; the loop exits when it
/// returns false. Used for run-until-empty draining.
pub type ContinuePredicate = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Runner configuration
#[derive(Clone)]
pub struct JobOptions {
    /// Loop until cancellation instead of running once
    pub run_continuous: bool,
    /// Delay between iterations; when unset the loop yields periodically
    pub interval: Option<Duration>,
    /// Delay before the first iteration
    pub initial_delay: Option<Duration>,
    /// Stop after this many iterations (None = unbounded)
    pub iteration_limit: Option<u32>,
    /// Parallel workers, each with its own factory-produced job instance
    pub instance_count: u32,
    /// Distributed lock taken around every iteration
    pub lock_provider: Option<Arc<dyn LockProvider>>,
    pub lock_timeout: Option<Duration>,
    pub lock_acquire_timeout: Option<Duration>,
    /// When set, instances wait until the channel reads true before starting
    pub startup: Option<watch::Receiver<bool>>,
    /// Evaluated after each continuous iteration; false stops the loop
    pub continue_while: Option<ContinuePredicate>,
    pub clock: Arc<dyn Clock>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            run_continuous: false,
            interval: None,
            initial_delay: None,
            iteration_limit: None,
            instance_count: 1,
            lock_provider: None,
            lock_timeout: None,
            lock_acquire_timeout: None,
            startup: None,
            continue_while: None,
            clock: SystemClock::shared(),
        }
    }
}

/// Runs factory-produced [`Job`] instances
pub struct JobRunner {
    factory: Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>,
    options: JobOptions,
}

impl JobRunner {
    /// Run a single shared job instance
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self::with_factory(move || job.clone())
    }

    /// Run jobs produced by `factory` (one per instance)
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn continuous(mut self) -> Self {
        self.options.run_continuous = true;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.options.interval = Some(interval);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.options.initial_delay = Some(delay);
        self
    }

    pub fn with_iteration_limit(mut self, limit: u32) -> Self {
        self.options.iteration_limit = Some(limit);
        self
    }

    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.options.instance_count = count.max(1);
        self
    }

    pub fn with_lock(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.options.lock_provider = Some(provider);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.options.clock = clock;
        self
    }

    /// Keep iterating only while `predicate` holds (e.g. queue not drained)
    pub fn run_while<F, Fut>(mut self, predicate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.options.continue_while = Some(Arc::new(move || predicate().boxed()));
        self.options.run_continuous = true;
        self
    }

    /// Run the configured instances to completion or cancellation.
    ///
    /// With multiple instances the first failure wins; otherwise a
    /// cancellation wins over plain success.
    pub async fn run(&self, cancellation: CancellationToken) -> JobResult {
        let instances = self.options.instance_count.max(1);
        if instances == 1 {
            let job = (self.factory)();
            return run_instance(job, self.options.clone(), cancellation).await;
        }

        let handles: Vec<_> = (0..instances)
            .map(|index| {
                let job = (self.factory)();
                let options = self.options.clone();
                let token = cancellation.clone();
                tokio::spawn(async move {
                    let result = run_instance(job, options, token).await;
                    tracing::debug!(instance = index, outcome = ?result.message(), "Job instance finished");
                    result
                })
            })
            .collect();

        let mut aggregate = JobResult::success();
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => JobResult::failure(format!("job instance panicked: {}", join_error)),
            };
            aggregate = match (aggregate, result) {
                (failure @ JobResult::Failure { .. }, _) => failure,
                (_, failure @ JobResult::Failure { .. }) => failure,
                (cancelled @ JobResult::Cancelled { .. }, _) => cancelled,
                (_, cancelled @ JobResult::Cancelled { .. }) => cancelled,
                (success, _) => success,
            };
        }
        aggregate
    }
}

async fn run_instance(
    job: Arc<dyn Job>,
    options: JobOptions,
    cancellation: CancellationToken,
) -> JobResult {
    if let Some(mut startup) = options.startup.clone() {
        tokio::select! {
            _ = cancellation.cancelled() => return JobResult::cancelled(),
            result = startup.wait_for(|ready| *ready) => {
                if result.is_err() {
                    return JobResult::failure("startup signal closed before firing");
                }
            }
        }
    }

    if let Some(delay) = options.initial_delay {
        tokio::select! {
            _ = cancellation.cancelled() => return JobResult::cancelled(),
            _ = options.clock.sleep(delay) => {}
        }
    }

    let mut iterations: u32 = 0;
    loop {
        if cancellation.is_cancelled() {
            return JobResult::cancelled();
        }

        let result = run_iteration(job.as_ref(), &options, &cancellation).await;
        iterations += 1;

        match &result {
            JobResult::Success { message } => {
                tracing::debug!(job = job.name(), iteration = iterations, message = ?message, "Job iteration succeeded");
            }
            JobResult::Cancelled { .. } => {
                tracing::info!(job = job.name(), iteration = iterations, "Job iteration cancelled");
            }
            JobResult::Failure { message, .. } => {
                tracing::error!(job = job.name(), iteration = iterations, %message, "Job iteration failed");
            }
        }

        if !options.run_continuous {
            return result;
        }
        if result.is_cancelled() {
            return result;
        }

        if let Some(limit) = options.iteration_limit {
            if iterations >= limit {
                return JobResult::success_with(format!("iteration limit {} reached", limit));
            }
        }

        if let Some(predicate) = &options.continue_while {
            if !predicate().await {
                return JobResult::success_with("continue predicate returned false");
            }
        }

        match options.interval {
            Some(interval) if !interval.is_zero() => {
                tokio::select! {
                    _ = cancellation.cancelled() => return JobResult::cancelled(),
                    _ = options.clock.sleep(interval) => {}
                }
            }
            _ => {
                // No interval: stay responsive to cancellation without
                // hammering the scheduler.
                if iterations % 1000 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

async fn run_iteration(
    job: &dyn Job,
    options: &JobOptions,
    cancellation: &CancellationToken,
) -> JobResult {
    let lock = match &options.lock_provider {
        Some(provider) => {
            match provider
                .acquire_cancellable(
                    job.name(),
                    options.lock_timeout,
                    options.lock_acquire_timeout,
                    cancellation,
                )
                .await
            {
                Ok(Some(lock)) => Some(lock),
                // Lock busy is not a hard failure: another instance is
                // already running this job.
                Ok(None) => {
                    return if cancellation.is_cancelled() {
                        JobResult::cancelled()
                    } else {
                        JobResult::success_with("unable to acquire job lock")
                    }
                }
                Err(error) => return JobResult::from_error(error),
            }
        }
        None => None,
    };

    let context = JobContext::new(cancellation.clone());
    let outcome = std::panic::AssertUnwindSafe(job.run(&context))
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(result) => result,
        Err(_) => JobResult::failure(format!("job {} panicked", job.name())),
    };

    if let Some(lock) = lock {
        if let Err(error) = lock.release().await {
            tracing::error!(job = job.name(), %error, "Failed to release job lock");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use async_trait::async_trait;
    use plinth_cache::InMemoryCacheBackend;
    use plinth_locks::CacheLockProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self, _context: &JobContext) -> JobResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            JobResult::success()
        }
    }

    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        async fn run(&self, _context: &JobContext) -> JobResult {
            JobResult::failure("always broken")
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        async fn run(&self, _context: &JobContext) -> JobResult {
            panic!("unexpected");
        }
    }

    #[tokio::test]
    async fn test_one_shot_runs_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let runner = JobRunner::new(Arc::new(CountingJob { runs: runs.clone() }));

        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_shot_failure_propagates() {
        let runner = JobRunner::new(Arc::new(FailingJob));
        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_failure());
        assert_eq!(result.message(), Some("always broken"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let runner = JobRunner::new(Arc::new(PanickingJob));
        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let runs = Arc::new(AtomicU32::new(0));
        let runner = JobRunner::new(Arc::new(CountingJob { runs: runs.clone() }))
            .continuous()
            .with_interval(Duration::from_millis(1))
            .with_iteration_limit(5);

        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cancellation_stops_continuous_loop() {
        let runs = Arc::new(AtomicU32::new(0));
        let runner = JobRunner::new(Arc::new(CountingJob { runs: runs.clone() }))
            .continuous()
            .with_interval(Duration::from_millis(10));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run(token))
            .await
            .expect("runner exits after cancellation");
        assert!(result.is_cancelled());
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_initial_delay_observed() {
        let runs = Arc::new(AtomicU32::new(0));
        let runner = JobRunner::new(Arc::new(CountingJob { runs: runs.clone() }))
            .with_initial_delay(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success());
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_instance_count_runs_separate_instances() {
        let runs = Arc::new(AtomicU32::new(0));
        let instances = Arc::new(AtomicU32::new(0));

        let runs_for_factory = runs.clone();
        let instances_for_factory = instances.clone();
        let runner = JobRunner::with_factory(move || {
            instances_for_factory.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingJob {
                runs: runs_for_factory.clone(),
            }) as Arc<dyn Job>
        })
        .with_instance_count(3);

        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(instances.load(Ordering::SeqCst), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lock_busy_is_not_failure() {
        let provider: Arc<dyn LockProvider> =
            Arc::new(CacheLockProvider::new(Arc::new(InMemoryCacheBackend::new())));

        // Hold the job lock so the runner cannot get it.
        let held = provider
            .acquire("CountingJob", None, Some(Duration::from_millis(50)))
            .await
            .unwrap()
            .unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let mut options = JobOptions {
            lock_provider: Some(provider),
            lock_acquire_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        options.instance_count = 1;

        let runner =
            JobRunner::new(Arc::new(CountingJob { runs: runs.clone() })).with_options(options);

        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success(), "lock-busy iteration is a soft skip");
        assert_eq!(result.message(), Some("unable to acquire job lock"));
        assert_eq!(runs.load(Ordering::SeqCst), 0, "job body never ran");

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_released_between_iterations() {
        let provider: Arc<dyn LockProvider> =
            Arc::new(CacheLockProvider::new(Arc::new(InMemoryCacheBackend::new())));

        let runs = Arc::new(AtomicU32::new(0));
        let runner = JobRunner::new(Arc::new(CountingJob { runs: runs.clone() }))
            .continuous()
            .with_interval(Duration::from_millis(1))
            .with_iteration_limit(3)
            .with_lock(provider.clone());

        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 3, "lock re-acquired each iteration");
        assert!(!provider.is_locked("CountingJob").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_while_drains() {
        let runs = Arc::new(AtomicU32::new(0));
        let budget = Arc::new(AtomicU32::new(4));

        let budget_for_predicate = budget.clone();
        let runner = JobRunner::new(Arc::new(CountingJob { runs: runs.clone() })).run_while(
            move || {
                let budget = budget_for_predicate.clone();
                async move { budget.fetch_sub(1, Ordering::SeqCst) > 1 }
            },
        );

        let result = runner.run(CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 4, "loop stops when the predicate fails");
    }

    #[tokio::test]
    async fn test_startup_gate_blocks_until_signal() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));

        let mut options = JobOptions::default();
        options.startup = Some(rx);
        let runner =
            JobRunner::new(Arc::new(CountingJob { runs: runs.clone() })).with_options(options);

        let handle = tokio::spawn({
            let token = CancellationToken::new();
            async move { runner.run(token).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0, "gated until startup fires");

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
