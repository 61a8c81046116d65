//! Closure-based mutex wrapper.
//!
//! Locks are only ever held for the duration of a closure, which keeps lock
//! scopes explicit and makes it impossible to hold a guard across an await
//! point. Poisoning is surfaced as an error instead of a panic.

use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(StdMutex<T>);

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex(StdMutex::new(value))
    }

    /// Runs `thunk` with the inner value locked. The result should be
    /// returned and handled outside the closure; never unwrap inside it.
    pub fn safe_lock<F, Ret>(&self, thunk: F) -> Result<Ret, PoisonError<MutexGuard<'_, T>>>
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let mut guard = self.0.lock()?;
        let ret = thunk(&mut *guard);
        drop(guard);
        Ok(ret)
    }
}
