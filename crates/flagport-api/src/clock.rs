//! Time source used by the rate governor and retry loops
//!
//! Reading the time and sleeping go through [`Clock`] so backoff math can be
//! exercised against virtual time.

use async_trait::async_trait;
use std::time::Duration;

/// Wall clock plus sleep
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as epoch milliseconds
    fn now_ms(&self) -> i64;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `chrono` and the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create new system clock
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_epoch_millis() {
        let now = SystemClock::new().now_ms();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        let clock = SystemClock::new();
        let before = std::time::Instant::now();
        clock.sleep(Duration::ZERO).await;
        assert!(before.elapsed() < Duration::from_millis(50));
    }
}
