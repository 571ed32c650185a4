//! Shared utilities.

mod observed_mutex;

pub use observed_mutex::{ObservedMutex, ObservedMutexGuard};
