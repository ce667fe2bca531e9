//! Graceful shutdown signalling.
//!
//! A [`ShutdownSignal`] fans a single trigger out to every worker through
//! cancellation tokens. Triggers: OS signals (interrupt/terminate), an
//! optional shutdown-indicator file, or a manual call.

use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Process-wide shutdown trigger
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by workers; cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutting down now
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Trigger on SIGINT (and SIGTERM on Unix)
    pub fn listen_for_signals(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            wait_for_os_signal().await;
            tracing::info!("Shutdown signal received");
            token.cancel();
        });
    }

    /// Trigger when `path` appears on disk, polled every `poll_interval`
    pub fn watch_file(&self, path: PathBuf, poll_interval: Duration) {
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    return;
                }
                if path.exists() {
                    tracing::info!(path = %path.display(), "Shutdown file detected");
                    token.cancel();
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_trigger() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.is_triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter wakes after trigger")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_tokens_share_the_trigger() {
        let shutdown = ShutdownSignal::new();
        let token_a = shutdown.token();
        let token_b = shutdown.token();

        shutdown.trigger();
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_file_detected() {
        let shutdown = ShutdownSignal::new();
        let path = std::env::temp_dir().join(format!("plinth-shutdown-{}", uuid::Uuid::new_v4()));

        shutdown.watch_file(path.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!shutdown.is_triggered());

        std::fs::write(&path, b"stop").unwrap();
        tokio::time::timeout(Duration::from_secs(2), shutdown.wait())
            .await
            .expect("file appearance triggers shutdown");

        std::fs::remove_file(&path).ok();
    }
}
