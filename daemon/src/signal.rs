//! Coordination primitives shared by the controller, the workers and the scheduler.
//!
//! Every loop in the daemon talks to the others through two kinds of cells:
//!
//!   - [`Signal`]: a named boolean. Commands ("start", "finish") and state
//!     ("running", "stream active") are both signals.
//!   - [`Slot`]: a published value with exactly one writer (a request payload,
//!     a progress snapshot, a result path, a failure message).
//!
//! Publication order is part of the contract: the writer fills the slots first
//! and sets the signal last. `Signal::set` is a release store and
//! `Signal::is_set` an acquire load, so a reader that observes the signal also
//! observes every slot written before it.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A named boolean condition polled cooperatively by a tick loop.
#[derive(Debug)]
pub struct Signal {
    name: &'static str,
    flag: AtomicBool,
}

impl Signal {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            flag: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clears the signal, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// A value published by a single writer and read as snapshots.
///
/// The lock is held only long enough to clone or replace the value, never
/// across a blocking call.
#[derive(Debug, Default)]
pub struct Slot<T> {
    value: Mutex<T>,
}

impl<T: Clone> Slot<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn publish(&self, value: T) {
        *self.lock() = value;
    }

    pub fn snapshot(&self) -> T {
        self.lock().clone()
    }

    /// Mutates the value in place under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // A panicked writer leaves a complete value behind (every write is a
        // single assignment), so a poisoned lock is still readable.
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
