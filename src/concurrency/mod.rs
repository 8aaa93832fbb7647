//! Completion tracking primitives shared by all pipeline stages.

pub mod completion;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires a standard mutex, recovering the guard if a previous holder panicked.
pub(crate) fn hold<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
