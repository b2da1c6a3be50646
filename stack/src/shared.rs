//! Optional mutual exclusion for multi-context drivers.
//!
//! The stack itself is single-threaded cooperative; this wrapper is the one
//! lock in the system, for embedders whose driver invokes the stack from more
//! than one execution context. Everything goes through [`SharedStack::with`],
//! which serializes whole operations — never hold frames or socket references
//! across the closure boundary.

use spin::Mutex;

use crate::stack::SocketStack;

pub struct SharedStack {
    inner: Mutex<SocketStack>,
}

impl SharedStack {
    pub const fn new(stack: SocketStack) -> Self {
        Self {
            inner: Mutex::new(stack),
        }
    }

    /// Run one stack operation under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut SocketStack) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Non-blocking variant; `None` when another context holds the lock.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut SocketStack) -> R) -> Option<R> {
        self.inner.try_lock().map(|mut stack| f(&mut stack))
    }

    /// Tear down, returning the inner stack.
    pub fn into_inner(self) -> SocketStack {
        self.inner.into_inner()
    }
}
