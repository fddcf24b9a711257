//! Time source for the reconciler
//!
//! All delays the reconciler takes go through a `ClockSource`, so tests can
//! substitute their own. The default `TokioClock` follows `tokio::time`, which
//! means `#[tokio::test(start_paused = true)]` drives it deterministically.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time and schedulable delays.
#[async_trait]
pub trait ClockSource: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl ClockSource for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
