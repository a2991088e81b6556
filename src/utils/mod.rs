//! Small shared helpers.

pub mod index;

pub use index::{IndexError, SequenceAllocator};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a table mutex.
///
/// Tables are only mutated through short critical sections that never
/// panic halfway, so a poisoned lock still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
