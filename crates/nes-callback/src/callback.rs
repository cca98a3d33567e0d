// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

struct State {
    cancelled: bool,
    executing: bool,
    executing_thread: Option<ThreadId>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

/// Shared state behind a `CallbackOwner`/`CallbackRef` pair (spec §4.3). As long as
/// any `CallbackRef` guard is alive the callback will not run; the last guard to drop
/// triggers it (unless the owner has cancelled it first). When `CallbackOwner` drops
/// it blocks until the callback has either fully run or is guaranteed to never run —
/// except when dropped from inside the callback itself, which would deadlock.
pub struct Callback {
    state: Mutex<State>,
    executing_condition: Condvar,
    guards: AtomicUsize,
}

impl Callback {
    /// Creates a new callback with guard count 1 (the returned `CallbackRef`).
    pub fn create() -> (CallbackOwner, CallbackRef) {
        let callback = Arc::new(Callback {
            state: Mutex::new(State {
                cancelled: false,
                executing: false,
                executing_thread: None,
                callback: None,
            }),
            executing_condition: Condvar::new(),
            guards: AtomicUsize::new(1),
        });
        let owner = CallbackOwner {
            inner: Some(Arc::clone(&callback)),
        };
        let guard = CallbackRef {
            inner: Some(callback),
        };
        (owner, guard)
    }

    /// Called when the last `CallbackRef` is dropped (guard count reaches 0).
    fn try_execute(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        let Some(callback) = state.callback.take() else {
            return;
        };
        state.executing = true;
        state.executing_thread = Some(std::thread::current().id());
        drop(state);

        callback();

        let mut state = self.state.lock().unwrap();
        state.executing = false;
        state.executing_thread = None;
        self.executing_condition.notify_all();
    }

    /// Called by `CallbackOwner`'s destructor. Blocks until it is safe to assume the
    /// callback is done or will never run.
    fn cancel_and_wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        state.callback = None;

        if state.executing_thread == Some(std::thread::current().id()) {
            // Dropped from within our own callback; waiting here would deadlock. The
            // callback is already unwinding up the stack and will finish regardless.
            return;
        }

        while state.executing {
            state = self.executing_condition.wait(state).unwrap();
        }
    }
}

/// Controls a `Callback`'s lifetime. As long as a `CallbackOwner` is alive the
/// callback it owns may still run. After its destructor completes, the callback is
/// guaranteed to have either fully executed or to never execute (spec §4.3).
pub struct CallbackOwner {
    inner: Option<Arc<Callback>>,
}

impl CallbackOwner {
    /// Sets the callback to run. Must be called before any `CallbackRef` drops.
    pub fn set_callback(&self, callback: impl FnOnce() + Send + 'static) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock().unwrap();
            state.callback = Some(Box::new(callback));
        }
    }
}

impl Drop for CallbackOwner {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.cancel_and_wait();
        }
    }
}

/// A guard that keeps a `Callback` from running while alive. The last `CallbackRef` to
/// drop executes the callback, unless the owner has already cancelled it.
pub struct CallbackRef {
    inner: Option<Arc<Callback>>,
}

impl CallbackRef {
    fn decrement_and_maybe_trigger(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner.guards.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.try_execute();
        }
    }
}

impl Clone for CallbackRef {
    fn clone(&self) -> Self {
        if let Some(inner) = &self.inner {
            inner.guards.fetch_add(1, Ordering::AcqRel);
        }
        CallbackRef {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for CallbackRef {
    fn drop(&mut self) {
        self.decrement_and_maybe_trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn runs_once_last_guard_drops() {
        let (owner, guard) = Callback::create();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        owner.set_callback(move || ran_clone.store(true, Ordering::SeqCst));

        let second_guard = guard.clone();
        drop(guard);
        assert!(!ran.load(Ordering::SeqCst), "still one guard outstanding");
        drop(second_guard);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn owner_drop_cancels_if_no_callback_ran_yet() {
        let (owner, guard) = Callback::create();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        owner.set_callback(move || ran_clone.store(true, Ordering::SeqCst));

        drop(owner);
        drop(guard);
        assert!(!ran.load(Ordering::SeqCst), "owner cancelled before guard dropped");
    }

    #[test]
    fn owner_drop_waits_for_in_flight_callback() {
        let (owner, guard) = Callback::create();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        owner.set_callback(move || {
            std::thread::sleep(Duration::from_millis(20));
            ran_clone.store(true, Ordering::SeqCst);
        });

        let handle = std::thread::spawn(move || drop(guard));
        std::thread::sleep(Duration::from_millis(5));
        drop(owner);
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_owner_from_within_callback_does_not_deadlock() {
        let (owner, guard) = Callback::create();
        let owner = Arc::new(Mutex::new(Some(owner)));
        let owner_clone = Arc::clone(&owner);
        owner
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .set_callback(move || {
                drop(owner_clone.lock().unwrap().take());
            });
        drop(guard);
        assert!(owner.lock().unwrap().is_none());
    }
}
