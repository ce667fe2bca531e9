//! Job contract and results.

use async_trait::async_trait;
use plinth_core::error::Error;
use tokio_util::sync::CancellationToken;

/// Outcome of one job iteration
#[derive(Debug)]
pub enum JobResult {
    /// The iteration finished; `message` carries optional context for logs
    Success { message: Option<String> },
    /// The iteration was aborted by cancellation
    Cancelled { message: Option<String> },
    /// The iteration failed
    Failure {
        message: String,
        source: Option<Error>,
    },
}

impl JobResult {
    pub fn success() -> Self {
        JobResult::Success { message: None }
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        JobResult::Success {
            message: Some(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        JobResult::Cancelled { message: None }
    }

    pub fn cancelled_with(message: impl Into<String>) -> Self {
        JobResult::Cancelled {
            message: Some(message.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        JobResult::Failure {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error(error: Error) -> Self {
        JobResult::Failure {
            message: error.to_string(),
            source: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobResult::Cancelled { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobResult::Failure { .. })
    }

    /// The attached message, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            JobResult::Success { message } | JobResult::Cancelled { message } => message.as_deref(),
            JobResult::Failure { message, .. } => Some(message),
        }
    }
}

/// Per-iteration context handed to [`Job::run`]
#[derive(Debug, Clone)]
pub struct JobContext {
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    /// Cooperative cancellation signal; long iterations should observe it
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A unit of work the runner invokes
#[async_trait]
pub trait Job: Send + Sync {
    /// Job name used for lock keys and logs; defaults to the short type name
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    async fn run(&self, context: &JobContext) -> JobResult;
}
