//! channel.rs
//! Hand-off primitives between pipeline stages.
//!
//! - **Ordered channel:** bounded FIFO over a crossbeam channel. `put` blocks while full,
//!   `get` waits up to a timeout. Used for operator signals, observation frames and
//!   actuation tables, where every item must be consumed in order.
//! - **Freshness buffer:** capacity-1 slot over `ArrayQueue::force_push`. Writers never
//!   block and always replace the unread item, readers get `Empty` when nothing is
//!   pending. Used only for raw telemetry.
//! - **Signal:** single-slot wake-up. Raising an already raised signal is a no-op, so a
//!   waiter sees at most one pending wake-up. Used for flash-ready / flash-done.
//!
//! Absence of data is a value (`ChannelError::Timeout` / `ChannelError::Empty`), never a
//! failure path; callers loop on it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{
    self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("no item arrived before the timeout")]
    Timeout,
    #[error("nothing pending")]
    Empty,
    #[error("peer side of the channel is gone")]
    Closed,
}

impl ChannelError {
    /// `Timeout` and `Empty` mean "nothing yet"; only `Closed` ends a loop.
    pub fn is_absence(&self) -> bool {
        matches!(self, ChannelError::Timeout | ChannelError::Empty)
    }
}

/// An item that could not be queued, handed back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    pub item: T,
    pub reason: ChannelError,
}

// ============================================================================
// Ordered channel
// ============================================================================

pub fn ordered<T>(capacity: usize) -> (OrderedSender<T>, OrderedReceiver<T>) {
    let (tx, rx) = channel::bounded(capacity);
    (OrderedSender { tx }, OrderedReceiver { rx })
}

pub struct OrderedSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for OrderedSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> OrderedSender<T> {
    /// Blocks while the channel is full.
    pub fn put(&self, item: T) -> Result<(), Rejected<T>> {
        self.tx.send(item).map_err(|e| Rejected {
            item: e.into_inner(),
            reason: ChannelError::Closed,
        })
    }

    /// Like [`put`](Self::put) but gives the item back after `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), Rejected<T>> {
        self.tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(item) => Rejected { item, reason: ChannelError::Timeout },
            SendTimeoutError::Disconnected(item) => Rejected { item, reason: ChannelError::Closed },
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

pub struct OrderedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> OrderedReceiver<T> {
    pub fn get(&self, timeout: Duration) -> Result<T, ChannelError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ChannelError::Timeout,
            RecvTimeoutError::Disconnected => ChannelError::Closed,
        })
    }

    pub fn try_get(&self) -> Result<T, ChannelError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => ChannelError::Empty,
            TryRecvError::Disconnected => ChannelError::Closed,
        })
    }

    /// Number of items queued and not yet consumed.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Discards everything currently queued; returns how many items were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}

// ============================================================================
// Freshness buffer
// ============================================================================

struct FreshSlot<T> {
    slot: ArrayQueue<T>,
    overwritten: Arc<AtomicU64>,
}

pub fn fresh<T>() -> (FreshWriter<T>, FreshReader<T>) {
    let shared = Arc::new(FreshSlot {
        slot: ArrayQueue::new(1),
        overwritten: Arc::new(AtomicU64::new(0)),
    });
    (
        FreshWriter { shared: shared.clone() },
        FreshReader { shared },
    )
}

pub struct FreshWriter<T> {
    shared: Arc<FreshSlot<T>>,
}

impl<T> FreshWriter<T> {
    /// Never blocks, never fails. Returns `true` when an unread item was replaced.
    pub fn put(&self, item: T) -> bool {
        match self.shared.slot.force_push(item) {
            Some(_stale) => {
                self.shared.overwritten.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

pub struct FreshReader<T> {
    shared: Arc<FreshSlot<T>>,
}

impl<T> FreshReader<T> {
    pub fn get(&self) -> Result<T, ChannelError> {
        self.shared.slot.pop().ok_or(ChannelError::Empty)
    }

    /// Drops the pending item, if any.
    pub fn clear(&self) -> bool {
        self.shared.slot.pop().is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.shared.slot.is_empty()
    }

    /// Items replaced before anyone read them since the buffer was created.
    pub fn overwritten(&self) -> u64 {
        self.shared.overwritten.load(Ordering::Relaxed)
    }

    /// Read-only handle on the overwrite count, for status reporting.
    pub fn overwrite_counter(&self) -> Arc<AtomicU64> {
        self.shared.overwritten.clone()
    }
}

impl<T> Clone for FreshReader<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

// ============================================================================
// Single-slot signal
// ============================================================================

pub fn signal<T>() -> (SignalSender<T>, SignalReceiver<T>) {
    let (tx, rx) = channel::bounded(1);
    (SignalSender { tx }, SignalReceiver { rx })
}

pub struct SignalSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for SignalSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> SignalSender<T> {
    /// Arms the signal. Returns `false` if it was already armed (the new value is dropped)
    /// or nobody is listening any more.
    pub fn raise(&self, value: T) -> bool {
        match self.tx.try_send(value) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct SignalReceiver<T> {
    rx: Receiver<T>,
}

impl<T> SignalReceiver<T> {
    pub fn wait(&self, timeout: Duration) -> Result<T, ChannelError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ChannelError::Timeout,
            RecvTimeoutError::Disconnected => ChannelError::Closed,
        })
    }

    /// Clears a pending wake-up without acting on it.
    pub fn drain(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
