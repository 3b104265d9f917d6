//! Time sources for the in-process store.
//!
//! Every bucket decision reads time from exactly one place. For Redis that is the
//! server's `TIME`; for the local store it is the [`Clock`] handed to it, shared by
//! every thread that calls in.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Authoritative time source.
///
/// Returns seconds since the Unix epoch, the same domain as Redis `TIME`, so
/// `retry_after` values mean the same thing for both stores.
pub trait Clock: Send + Sync {
    /// Current time in seconds.
    fn now(&self) -> f64;
}

/// Wall clock of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0f64)
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give another
/// to the store.
///
/// ```
/// use bucketgate::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(100.0);
/// clock.advance(Duration::from_millis(500));
/// assert_eq!(clock.now(), 100.5);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at `seconds`.
    pub fn new(seconds: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(seconds.to_bits())),
        }
    }

    /// Jump to `seconds`. Going backwards is allowed.
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let _ = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + by.as_secs_f64()).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
