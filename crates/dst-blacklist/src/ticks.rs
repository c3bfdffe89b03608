//! Coarse monotonic time used for expiry bookkeeping
//!
//! Expiry is tracked in ticks rather than wall-clock timestamps. One tick is
//! 1/16 of a second, which is plenty of resolution for TTLs measured in
//! seconds and keeps the per-entry timestamp cheap to compare.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic tick count
pub type Ticks = u64;

/// Ticks per second
pub const TICKS_HZ: u64 = 16;

/// Convert seconds to ticks
pub const fn s_to_ticks(secs: u64) -> Ticks {
    secs * TICKS_HZ
}

/// Convert milliseconds to ticks, rounding down
pub const fn ms_to_ticks(ms: u64) -> Ticks {
    ms * TICKS_HZ / 1000
}

/// Convert ticks to whole seconds, rounding down
pub const fn ticks_to_s(ticks: Ticks) -> u64 {
    ticks / TICKS_HZ
}

/// Convert ticks to milliseconds
pub const fn ticks_to_ms(ticks: Ticks) -> u64 {
    ticks * 1000 / TICKS_HZ
}

/// Convert a duration to ticks, rounding down
pub fn duration_to_ticks(duration: Duration) -> Ticks {
    let ticks = duration.as_millis() * TICKS_HZ as u128 / 1000;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// Source of the current tick count
pub trait Clock: Send + Sync {
    /// Current tick; never goes backwards
    fn now(&self) -> Ticks;
}

/// Clock backed by [`Instant`], counting from its creation
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Ticks {
        duration_to_ticks(self.origin.elapsed())
    }
}

/// Clock that only moves when told to
///
/// Used by tests and by embedders that already keep their own tick counter.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Ticks) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Move the clock forward by `ticks`
    pub fn advance(&self, ticks: Ticks) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Move the clock forward by a duration
    pub fn advance_by(&self, duration: Duration) {
        self.advance(duration_to_ticks(duration));
    }

    /// Jump to an absolute tick; refuses to go backwards
    pub fn set(&self, ticks: Ticks) {
        self.ticks.fetch_max(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        self.ticks.load(Ordering::SeqCst)
    }
}
