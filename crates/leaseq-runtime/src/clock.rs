//! Time sources consumed by the queue engines.
//!
//! Engines never read the system time directly. Everything goes through a
//! [`Clock`] so tests can drive visibility timeouts deterministically with
//! [`ManualClock`].

use crate::error::ClockError;
use std::sync::atomic::{AtomicI64, Ordering};

/// A source of millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the UNIX epoch
    fn now_ms(&self) -> i64;

    /// Jump to an absolute time (test clocks only)
    fn set_now_ms(&self, timestamp_ms: i64) -> Result<(), ClockError>;

    /// Let `delta_ms` milliseconds pass
    fn advance(&self, delta_ms: i64);
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn set_now_ms(&self, _timestamp_ms: i64) -> Result<(), ClockError> {
        Err(ClockError::Unsupported {
            operation: "set_now_ms".to_string(),
        })
    }

    /// Blocks the calling thread.
    fn advance(&self, delta_ms: i64) {
        if delta_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delta_ms as u64));
        }
    }
}

/// Controllable clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn set_now_ms(&self, timestamp_ms: i64) -> Result<(), ClockError> {
        self.now_ms.store(timestamp_ms, Ordering::SeqCst);
        Ok(())
    }

    fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
