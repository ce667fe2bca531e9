//! Console host: run a job runner under OS shutdown signals with
//! exit-code mapping.

use crate::job::JobResult;
use crate::runner::JobRunner;
use crate::shutdown::ShutdownSignal;
use plinth_core::error::Result;
use std::time::Duration;

/// Console host configuration
#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    /// Environment variable naming a shutdown-indicator file to poll
    pub shutdown_file_env_var: Option<String>,
    /// How often the shutdown file is polled
    pub file_poll_interval: Duration,
    /// How long to wait for in-flight work after shutdown starts
    pub drain_timeout: Duration,
    /// Install a tracing-subscriber fmt layer (env-filter controlled)
    pub install_tracing: bool,
    /// Hook SIGINT/SIGTERM; disable in tests
    pub listen_for_signals: bool,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            shutdown_file_env_var: Some("PLINTH_SHUTDOWN_FILE".to_string()),
            file_poll_interval: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(30),
            install_tracing: true,
            listen_for_signals: true,
        }
    }
}

/// Build the runner via `setup` and run it until completion or shutdown.
///
/// Exit codes: `0` on success or graceful shutdown, `-1` on job failure or
/// when the drain period elapses, `1` when `setup` fails.
pub async fn run_in_console<F>(setup: F, options: ConsoleOptions) -> i32
where
    F: FnOnce() -> Result<JobRunner>,
{
    if options.install_tracing {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    }

    let runner = match setup() {
        Ok(runner) => runner,
        Err(error) => {
            tracing::error!(%error, "Job setup failed");
            return 1;
        }
    };

    let shutdown = ShutdownSignal::new();
    if options.listen_for_signals {
        shutdown.listen_for_signals();
    }
    if let Some(env_var) = &options.shutdown_file_env_var {
        if let Ok(path) = std::env::var(env_var) {
            if !path.is_empty() {
                shutdown.watch_file(path.into(), options.file_poll_interval);
            }
        }
    }

    let token = shutdown.token();
    let drain_token = token.clone();
    let drain_timeout = options.drain_timeout;

    let run = runner.run(token);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = async {
            drain_token.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::error!("Job did not stop within the drain period");
            return -1;
        }
    };

    match result {
        JobResult::Success { message } => {
            tracing::info!(message = ?message, "Job finished");
            0
        }
        JobResult::Cancelled { message } => {
            tracing::info!(message = ?message, "Job stopped by shutdown");
            0
        }
        JobResult::Failure { message, .. } => {
            tracing::error!(%message, "Job failed");
            -1
        }
    }
}
