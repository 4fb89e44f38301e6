//! Time source used by the engine.
//!
//! The control loop never calls `Utc::now()` or `tokio::time::sleep` directly;
//! everything goes through a [`Clock`] so tests can run against virtual time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Wall-clock reading plus a sleep primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock instant.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock: system wall time, tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wall clock derived from tokio's monotonic timer.
///
/// `now()` is `origin + (tokio::time::Instant::now() - start)`. Under a paused
/// runtime (`#[tokio::test(start_paused = true)]` or `tokio::time::pause()`)
/// tokio auto-advances its timer whenever every task is idle, so this clock
/// moves exactly as far as the engine sleeps and tests become deterministic.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    origin: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl VirtualClock {
    /// Create a clock that reads `origin` right now.
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            start: tokio::time::Instant::now(),
        }
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        // Elapsed time fits comfortably in chrono's range for any test run.
        let elapsed = chrono::Duration::from_std(self.start.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
