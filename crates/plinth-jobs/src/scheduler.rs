//! Cron-scheduled job runner.
//!
//! Jobs are registered with a cron expression (`sec min hour dom month dow`)
//! and fire on a minute-aligned tick. Before starting an occurrence the
//! runner takes a cluster lock keyed `{job}:{minute-bucket}`; with a
//! throttling lock provider shared through a common cache backend, a given
//! occurrence runs at most once across all nodes.

use crate::job::{Job, JobContext, JobResult};
use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::{Error, Result};
use plinth_locks::LockProvider;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type JobFactory = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

struct ScheduledJob {
    name: String,
    schedule: Schedule,
    factory: JobFactory,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

/// Point-in-time view of a registered schedule
#[derive(Debug, Clone)]
pub struct ScheduledJobStatus {
    pub name: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Runs registered jobs on their cron schedules
pub struct ScheduledJobRunner {
    jobs: Mutex<Vec<ScheduledJob>>,
    lock_provider: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
}

impl ScheduledJobRunner {
    /// `lock_provider` guards occurrence buckets; share a throttling provider
    /// across nodes for cluster single-fire.
    pub fn new(lock_provider: Arc<dyn LockProvider>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            lock_provider,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a job under a cron expression
    /// (`sec min hour day-of-month month day-of-week`)
    pub fn register<F>(&self, name: impl Into<String>, cron_expression: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    {
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            Error::configuration(format!(
                "invalid cron expression '{}': {}",
                cron_expression, e
            ))
        })?;

        let now = self.clock.utc_now();
        let next_run = schedule.after(&now).next();
        let name = name.into();
        tracing::info!(job = %name, cron = cron_expression, next_run = ?next_run, "Scheduled job registered");

        self.jobs.lock().push(ScheduledJob {
            name,
            schedule,
            factory: Arc::new(factory),
            last_run: None,
            next_run,
        });
        Ok(())
    }

    /// Remove a registered job
    pub fn unregister(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        jobs.len() != before
    }

    /// Status of every registered schedule
    pub fn status(&self) -> Vec<ScheduledJobStatus> {
        self.jobs
            .lock()
            .iter()
            .map(|j| ScheduledJobStatus {
                name: j.name.clone(),
                last_run: j.last_run,
                next_run: j.next_run,
            })
            .collect()
    }

    /// Tick loop: fires due jobs every minute until cancelled
    pub async fn run(&self, cancellation: CancellationToken) {
        tracing::info!("Scheduled job runner started");
        loop {
            let now = self.clock.utc_now();
            let next_minute = next_minute_boundary(now);

            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = self.clock.sleep_until(next_minute) => {}
            }

            self.tick(&cancellation).await;
        }
        tracing::info!("Scheduled job runner stopped");
    }

    /// Start every due job; exposed for deterministic tests.
    /// Returns the number of jobs started on this node.
    pub async fn tick(&self, cancellation: &CancellationToken) -> usize {
        let now = self.clock.utc_now();

        let due: Vec<(String, JobFactory, DateTime<Utc>)> = {
            let mut jobs = self.jobs.lock();
            let mut due = Vec::new();
            for job in jobs.iter_mut() {
                let Some(next_run) = job.next_run else { continue };
                if next_run > now || job.last_run == Some(next_run) {
                    continue;
                }
                job.last_run = Some(next_run);
                job.next_run = job.schedule.after(&now).next();
                due.push((job.name.clone(), job.factory.clone(), next_run));
            }
            due
        };

        let mut started = 0;
        for (name, factory, occurrence) in due {
            // One winner per occurrence bucket across the cluster.
            let bucket_key = format!("{}:{}", name, occurrence.format("%Y-%m-%dT%H:%M"));
            let acquired = match self
                .lock_provider
                .try_acquire(&bucket_key, Duration::from_secs(60))
                .await
            {
                Ok(acquired) => acquired,
                Err(error) => {
                    tracing::error!(job = %name, %error, "Scheduler lock acquire failed");
                    continue;
                }
            };

            if acquired.is_none() {
                tracing::debug!(job = %name, bucket = %bucket_key, "Occurrence already claimed");
                continue;
            }

            started += 1;
            let job = factory();
            let token = cancellation.child_token();
            tokio::spawn(async move {
                let context = JobContext::new(token);
                let result = job.run(&context).await;
                match result {
                    JobResult::Failure { message, .. } => {
                        tracing::error!(job = job.name(), %message, "Scheduled job failed");
                    }
                    _ => {
                        tracing::info!(job = job.name(), "Scheduled job finished");
                    }
                }
            });
        }
        started
    }
}

fn next_minute_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + chrono::Duration::minutes(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plinth_cache::{CacheBackend, InMemoryCacheBackend};
    use plinth_core::clock::ManualClock;
    use plinth_locks::ThrottlingLockProvider;
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

    fn counting_factory(runs: Arc<AtomicU32>) -> impl Fn() -> Arc<dyn Job> + Send + Sync {
        move || Arc::new(CountingJob { runs: runs.clone() }) as Arc<dyn Job>
    }

    fn runner_with_clock(clock: Arc<ManualClock>) -> ScheduledJobRunner {
        let backend = Arc::new(InMemoryCacheBackend::new().with_clock(clock.clone()));
        let provider = Arc::new(
            ThrottlingLockProvider::new(backend, 1, Duration::from_secs(60))
                .with_clock(clock.clone()),
        );
        ScheduledJobRunner::new(provider).with_clock(clock)
    }

    #[tokio::test]
    async fn test_invalid_cron_is_configuration_error() {
        let clock = ManualClock::starting_now();
        let runner = runner_with_clock(clock);
        let err = runner
            .register("bad", "not a cron", counting_factory(Arc::new(AtomicU32::new(0))))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_job_fires_when_due() {
        let clock = ManualClock::starting_now();
        let runner = runner_with_clock(clock.clone());
        let runs = Arc::new(AtomicU32::new(0));

        runner
            .register("every-minute", "0 * * * * *", counting_factory(runs.clone()))
            .unwrap();

        let token = CancellationToken::new();
        assert_eq!(runner.tick(&token).await, 0, "not yet due");

        clock.advance(Duration::from_secs(61));
        assert_eq!(runner.tick(&token).await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let status = &runner.status()[0];
        assert!(status.last_run.is_some());
        assert!(status.next_run.unwrap() > clock.utc_now());
    }

    #[tokio::test]
    async fn test_same_occurrence_not_restarted() {
        let clock = ManualClock::starting_now();
        let runner = runner_with_clock(clock.clone());
        let runs = Arc::new(AtomicU32::new(0));

        runner
            .register("once", "0 * * * * *", counting_factory(runs.clone()))
            .unwrap();

        let token = CancellationToken::new();
        clock.advance(Duration::from_secs(61));
        assert_eq!(runner.tick(&token).await, 1);
        assert_eq!(runner.tick(&token).await, 0, "same occurrence skipped");
    }

    #[tokio::test]
    async fn test_cluster_single_fire() {
        let clock = ManualClock::starting_now();
        let backend: Arc<dyn CacheBackend> =
            Arc::new(InMemoryCacheBackend::new().with_clock(clock.clone()));

        let runs = Arc::new(AtomicU32::new(0));
        let mut runners = Vec::new();
        for _ in 0..2 {
            let provider = Arc::new(
                ThrottlingLockProvider::new(backend.clone(), 1, Duration::from_secs(60))
                    .with_clock(clock.clone()),
            );
            let runner = ScheduledJobRunner::new(provider).with_clock(clock.clone());
            runner
                .register("cluster-job", "0 * * * * *", counting_factory(runs.clone()))
                .unwrap();
            runners.push(runner);
        }

        let token = CancellationToken::new();
        clock.advance(Duration::from_secs(61));

        let mut started = 0;
        for runner in &runners {
            started += runner.tick(&token).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started, 1, "exactly one node wins the occurrence");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let clock = ManualClock::starting_now();
        let runner = runner_with_clock(clock.clone());
        let runs = Arc::new(AtomicU32::new(0));

        runner
            .register("gone", "0 * * * * *", counting_factory(runs.clone()))
            .unwrap();
        assert!(runner.unregister("gone"));
        assert!(!runner.unregister("gone"));

        clock.advance(Duration::from_secs(61));
        assert_eq!(runner.tick(&CancellationToken::new()).await, 0);
    }
}
