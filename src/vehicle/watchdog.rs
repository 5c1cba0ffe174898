//! watchdog.rs
//! Failure counters shared by the capture, listener and flash workers.
//!
//! Both counters sit behind one dedicated mutex, separate from the client lock, so
//! counting a failure never waits on an in-flight protocol call. Counters only grow.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureCounters {
    pub capture: u64,
    pub flash: u64,
}

#[derive(Clone, Default)]
pub struct Watchdog {
    counters: Arc<Mutex<FailureCounters>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count.
    pub fn record_capture_failure(&self) -> u64 {
        let mut c = self.counters.lock();
        c.capture += 1;
        c.capture
    }

    pub fn record_flash_failure(&self) -> u64 {
        let mut c = self.counters.lock();
        c.flash += 1;
        c.flash
    }

    pub fn snapshot(&self) -> FailureCounters {
        *self.counters.lock()
    }
}
