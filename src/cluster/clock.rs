//! Injectable time source.
//!
//! Every lease, heartbeat and expiry check reads time through [`Clock`] so
//! tests can drive expiry deterministically with [`ManualClock`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync + Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Absolute expiry for a relative TTL. Zero means the entry never expires.
pub(crate) fn expiry_for(now_ms: u64, ttl: Duration) -> Option<u64> {
    if ttl.is_zero() {
        None
    } else {
        Some(now_ms.saturating_add(ttl.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance_and_set() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now_ms(), 31_000);

        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_expiry_for_zero_ttl_never_expires() {
        assert_eq!(expiry_for(100, Duration::ZERO), None);
        assert_eq!(expiry_for(100, Duration::from_millis(50)), Some(150));
    }
}
