//! Mutual exclusion with debug-build holder tracking.
//!
//! Wraps a plain mutex. Debug builds additionally record each holder as a
//! `(thread, tag)` pair and report re-entry by the same holder before it
//! would turn into a silent deadlock; release builds compile down to the
//! plain mutex. Distinct threads contending on the lock are legitimate and
//! simply block.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

#[cfg(debug_assertions)]
use std::collections::BTreeSet;
#[cfg(debug_assertions)]
use tracing::error;

#[cfg(debug_assertions)]
fn holder_key(tag: &str) -> String {
    format!("{:?}:{}", std::thread::current().id(), tag)
}

/// A mutex whose acquisitions carry a diagnostic tag.
pub struct ObservedMutex<T> {
    inner: Mutex<T>,
    #[cfg(debug_assertions)]
    holders: Mutex<BTreeSet<String>>,
}

impl<T> ObservedMutex<T> {
    /// Create a new mutex holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            #[cfg(debug_assertions)]
            holders: Mutex::new(BTreeSet::new()),
        }
    }

    /// Acquire the lock. `tag` identifies the caller in diagnostics.
    ///
    /// Debug builds panic when the same thread acquires the lock under the
    /// same tag without releasing it: re-entry is always a bug, never
    /// silently tolerated.
    pub fn lock(&self, tag: &str) -> ObservedMutexGuard<'_, T> {
        #[cfg(not(debug_assertions))]
        let _ = tag;
        #[cfg(debug_assertions)]
        let key = {
            let key = holder_key(tag);
            let reentered = !self.holders.lock().unwrap().insert(key.clone());
            if reentered {
                error!(tag, "lock already held by the same holder");
                panic!("lock re-entered by holder '{tag}'");
            }
            key
        };
        ObservedMutexGuard {
            guard: self.inner.lock().unwrap(),
            #[cfg(debug_assertions)]
            holders: &self.holders,
            #[cfg(debug_assertions)]
            key,
        }
    }
}

/// Guard returned by [`ObservedMutex::lock`].
pub struct ObservedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    #[cfg(debug_assertions)]
    holders: &'a Mutex<BTreeSet<String>>,
    #[cfg(debug_assertions)]
    key: String,
}

impl<T> Deref for ObservedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ObservedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ObservedMutexGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.holders.lock().unwrap().remove(&self.key);
    }
}
