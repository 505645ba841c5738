//! Observers for capture and replay activity.
//!
//! The engines call these synchronously from their worker threads, in the
//! order the datagrams were received or sent. Implementations must return
//! quickly; a slow listener delays the capture or the replay timing.
//!
//! Closures with the matching signature implement the traits, so
//! registering a callback is just
//!
//! ```rust
//! use dispr::listener::{Listeners, SentListener};
//! use std::sync::Arc;
//!
//! let sent: Listeners<dyn SentListener> = Listeners::new();
//! sent.add(Arc::new(|record: u64, total: u64, reverse: bool| {
//!     println!("sent #{record} ({total} so far, reverse={reverse})");
//! }));
//! assert_eq!(sent.len(), 1);
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use crate::recording::{Capture, CaptureEnd, StopReason};

/// A datagram was captured. `total` is the record count of the capture so far.
pub trait ReceivedListener: Send + Sync {
    fn packet_received(&self, capture: &Capture, total: usize);
}

/// A record was transmitted by a replay run.
pub trait SentListener: Send + Sync {
    fn packet_sent(&self, record: u64, total_sent: u64, reverse: bool);
}

/// A replay run ended, for whatever reason.
pub trait StoppedListener: Send + Sync {
    fn sender_stopped(&self, reason: &StopReason);
}

/// A capture worker ended.
pub trait CaptureEndedListener: Send + Sync {
    fn capture_ended(&self, capture: &Capture, end: &CaptureEnd);
}

impl<F> ReceivedListener for F
where
    F: Fn(&Capture, usize) + Send + Sync,
{
    fn packet_received(&self, capture: &Capture, total: usize) {
        self(capture, total)
    }
}

impl<F> SentListener for F
where
    F: Fn(u64, u64, bool) + Send + Sync,
{
    fn packet_sent(&self, record: u64, total_sent: u64, reverse: bool) {
        self(record, total_sent, reverse)
    }
}

impl<F> StoppedListener for F
where
    F: Fn(&StopReason) + Send + Sync,
{
    fn sender_stopped(&self, reason: &StopReason) {
        self(reason)
    }
}

impl<F> CaptureEndedListener for F
where
    F: Fn(&Capture, &CaptureEnd) + Send + Sync,
{
    fn capture_ended(&self, capture: &Capture, end: &CaptureEnd) {
        self(capture, end)
    }
}

/// Registered listeners of one kind, shareable between a controller and the
/// engines it creates.
pub struct Listeners<L: ?Sized> {
    inner: Arc<RwLock<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove `listener`, comparing by identity. Returns false if it was not registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current registrations.
    ///
    /// Notifying from a copy lets a listener register or remove listeners
    /// without deadlocking.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn notify(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}

impl<L: ?Sized> Clone for Listeners<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}
