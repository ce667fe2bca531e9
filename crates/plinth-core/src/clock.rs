//! Abstracted time source.
//!
//! Components never call `tokio::time` directly; they go through a [`Clock`]
//! carried in their options. Production code uses [`SystemClock`], tests install
//! a [`ManualClock`] and advance virtual time deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Time source used for timestamps and timed waits.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in UTC
    fn utc_now(&self) -> DateTime<Utc>;

    /// Suspend the current task for `duration`
    async fn sleep(&self, duration: Duration);

    /// Suspend the current task until `deadline`; returns immediately if the
    /// deadline has already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = self.utc_now();
        if deadline > now {
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            self.sleep(remaining).await;
        }
    }
}

/// Wall-clock time backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle suitable for component options
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

struct Sleeper {
    deadline: DateTime<Utc>,
    waker: oneshot::Sender<()>,
}

/// Manually advanced clock for tests.
///
/// `sleep` registers a waiter that is only woken when [`ManualClock::advance`]
/// or [`ManualClock::set_now`] moves virtual time past its deadline.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleepers: Mutex<Vec<Sleeper>>,
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.lock())
            .field("sleepers", &self.sleepers.lock().len())
            .finish()
    }
}

impl ManualClock {
    /// Create a manual clock starting at the given instant
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
            sleepers: Mutex::new(Vec::new()),
        })
    }

    /// Create a manual clock starting at the real current time
    pub fn starting_now() -> Arc<Self> {
        Self::new(Utc::now())
    }

    /// Move virtual time forward, waking every sleeper whose deadline passed
    pub fn advance(&self, duration: Duration) {
        let target = {
            let now = self.now.lock();
            *now + chrono::Duration::from_std(duration).expect("advance out of range")
        };
        self.set_now(target);
    }

    /// Jump virtual time to `target`, waking every sleeper whose deadline passed
    pub fn set_now(&self, target: DateTime<Utc>) {
        {
            let mut now = self.now.lock();
            if target > *now {
                *now = target;
            }
        }

        let due: Vec<Sleeper> = {
            let mut sleepers = self.sleepers.lock();
            let (ready, waiting) = std::mem::take(&mut *sleepers)
                .into_iter()
                .partition(|s| s.deadline <= target);
            *sleepers = waiting;
            ready
        };

        for sleeper in due {
            // Receiver may already be gone if the sleeping task was dropped.
            let _ = sleeper.waker.send(());
        }
    }

    /// Number of tasks currently parked in `sleep`
    pub fn sleeper_count(&self) -> usize {
        self.sleepers.lock().len()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        let (tx, rx) = oneshot::channel();
        {
            let now = *self.now.lock();
            let deadline =
                now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
            self.sleepers.lock().push(Sleeper {
                deadline,
                waker: tx,
            });
        }

        // The sender is dropped (not fired) only if the clock itself is dropped;
        // treat that as a wakeup so shutdown never hangs.
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_clock_now() {
        let clock = SystemClock;
        let before = Utc::now();
        let now = clock.utc_now();
        assert!(now >= before);
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_wakes_on_advance() {
        let clock = ManualClock::starting_now();

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep(Duration::from_secs(60)).await;
            })
        };

        // Give the task a chance to park.
        tokio::task::yield_now().await;
        while clock.sleeper_count() == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_secs(59));
        assert_eq!(clock.sleeper_count(), 1, "not yet due");

        clock.advance(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(2), sleeper)
            .await
            .expect("sleeper should wake after advance")
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_until_past_deadline() {
        let clock = ManualClock::starting_now();
        let past = clock.utc_now() - chrono::Duration::seconds(10);
        // Must not park at all.
        clock.sleep_until(past).await;
    }

    #[tokio::test]
    async fn test_manual_clock_zero_sleep_returns() {
        let clock = ManualClock::starting_now();
        clock.sleep(Duration::ZERO).await;
        assert_eq!(clock.sleeper_count(), 0);
    }
}
