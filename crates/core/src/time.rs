//! Time source abstraction.
//!
//! Every deadline and TTL in the control plane is enforced by comparing
//! nanosecond timestamps obtained from a [`Clock`]; nothing blocks waiting
//! for time to pass.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds per second
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Source of the current time in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Current time in nanoseconds since the Unix epoch
    fn now_ns(&self) -> u64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        // A clock before the epoch reads as zero, which makes every TTL look expired.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start_ns`
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now_ns
            .fetch_add(duration_to_ns(by), Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// Convert whole seconds to nanoseconds, saturating on overflow
pub fn secs_to_ns(secs: u64) -> u64 {
    secs.saturating_mul(NANOS_PER_SEC)
}

/// Convert a [`Duration`] to nanoseconds, saturating on overflow
pub fn duration_to_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
