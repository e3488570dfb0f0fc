//! Monotonic event counts.
//!
//! The original design's suspension points (`wait_for_page_transition`,
//! AOTE/ASTE lookup racing an in-flight activation, dismount-quiesce) all
//! follow the same shape: a waiter reads the counter's current value before
//! releasing its lock, then parks until the counter reaches `value + 1`.
//! Advancers increment *after* mutating state to its final, waiter-visible
//! form (§5, "Ordering guarantees"). [`EventCount`] implements exactly that
//! contract on top of a [`Condvar`], replacing the external `ec_init` /
//! `ec_advance` / `ec_wait` collaborator contract named in §6 — the core
//! owns these directly rather than treating them as a foreign dependency,
//! since std gives us a real condition variable to build them on.

use std::sync::{Condvar, Mutex};

/// A monotonically-advancing counter with a wait primitive.
///
/// Cloning is not supported; an `EventCount` is embedded by value inside the
/// table it guards (one per AST-in-trans / PMAP-in-trans / dismount EC).
#[derive(Debug, Default)]
pub struct EventCount {
    value: Mutex<u64>,
    condvar: Condvar,
}

impl EventCount {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Snapshot the current value. Callers take this *before* releasing the
    /// lock that protects the state they're about to wait on, then call
    /// [`EventCount::wait`] with `snapshot + 1` after releasing it.
    pub fn read(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    /// Advance the counter by one and wake all waiters. Must be called only
    /// after the state the waiters care about has reached its final,
    /// consumer-visible form.
    pub fn advance(&self) {
        let mut guard = self.value.lock().unwrap();
        *guard = guard.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Block until the counter reaches at least `target`. If it has already
    /// reached `target` this returns immediately without sleeping.
    pub fn wait(&self, target: u64) {
        let mut guard = self.value.lock().unwrap();
        while *guard < target {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Convenience: snapshot-then-wait-for-next, for the common
    /// "observe IN_TRANSITION, wait for the next advance" pattern.
    pub fn wait_for_next(&self) {
        let target = self.read().wrapping_add(1);
        self.wait(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_if_already_advanced() {
        let ec = EventCount::new();
        ec.advance();
        ec.wait(1);
    }

    #[test]
    fn waiter_wakes_after_advance() {
        let ec = Arc::new(EventCount::new());
        let waiter = Arc::clone(&ec);
        let target = ec.read() + 1;
        let handle = thread::spawn(move || {
            waiter.wait(target);
        });
        thread::sleep(Duration::from_millis(20));
        ec.advance();
        handle.join().unwrap();
    }
}
