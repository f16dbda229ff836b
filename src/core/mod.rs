//! The execution engine: ports, processes, protocols, jobs, experiments and the queue.

pub mod activity;
pub mod config;
pub mod error;
pub mod experiment;
pub mod io;
pub mod job;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod resource;

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A helper trait that just provides the `as_any` method.
/// Needed for downcasting a `ProcessLogic` to its concrete type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: 'static> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Every guarded value in the engine is plain data, so a poisoned lock never
/// hides a broken invariant.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
