//! exit.rs
//! Process-wide exit token.
//!
//! Cloned into every worker. Triggering it is sticky and wakes every thread parked in
//! [`ExitToken::sleep`] at once: the token holds the only sender of a zero-traffic
//! channel, and dropping that sender disconnects every receiver clone.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

struct Shared {
    fired: AtomicBool,
    closer: Mutex<Option<Sender<()>>>,
}

#[derive(Clone)]
pub struct ExitToken {
    shared: Arc<Shared>,
    woken: Receiver<()>,
}

impl ExitToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            shared: Arc::new(Shared {
                fired: AtomicBool::new(false),
                closer: Mutex::new(Some(tx)),
            }),
            woken: rx,
        }
    }

    pub fn trigger(&self) {
        self.shared.fired.store(true, Ordering::Release);
        self.shared.closer.lock().take();
    }

    pub fn is_set(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }

    /// Sleeps up to `d`. Returns `true` if exit was (or already had been) requested.
    pub fn sleep(&self, d: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        match self.woken.recv_timeout(d) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) | Ok(()) => self.is_set(),
        }
    }
}

impl Default for ExitToken {
    fn default() -> Self {
        Self::new()
    }
}
