//! Injectable time source.
//!
//! All routing math (EWMA freshness, breaker penalties, rate-limit windows)
//! runs on monotonic time so tests can drive it deterministically; wall-clock
//! time is used only for persisted audit rows.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A time source the engine components are built against.
///
/// `now_mono` returns a monotonic offset from an arbitrary epoch fixed at
/// construction. Two readings from the same clock are comparable; readings
/// from different clocks are not.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic time since the clock's epoch.
    fn now_mono(&self) -> Duration;

    /// Wall-clock time, for persisted audit rows only.
    fn now_wall(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Instant` and `Utc::now`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_mono(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests.
///
/// Starts at zero; `advance` moves monotonic time forward. Wall time is
/// derived from a fixed base plus the monotonic offset.
pub struct ManualClock {
    millis: AtomicU64,
    wall_base: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicU64::new(0),
            wall_base: Utc::now(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.millis.store(at.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_mono(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn now_wall(&self) -> DateTime<Utc> {
        self.wall_base + chrono::Duration::milliseconds(self.millis.load(Ordering::SeqCst) as i64)
    }
}
