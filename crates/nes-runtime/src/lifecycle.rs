// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{RuntimeError, RuntimeResult};
use nes_callback::{Callback, CallbackOwner, CallbackRef};
use nes_types::QueryId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// A query's lifecycle state (spec §4.5 "Per-query lifecycle"). `Invalid` is not a
/// state a query ever sits in; it is only ever the *result* of attempting an illegal
/// transition, surfaced as `RuntimeError::LifecycleViolation` rather than stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryState {
    Created = 0,
    Deployed = 1,
    Running = 2,
    Stopped = 3,
    Finished = 4,
    ErrorState = 5,
}

impl QueryState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueryState::Created,
            1 => QueryState::Deployed,
            2 => QueryState::Running,
            3 => QueryState::Stopped,
            4 => QueryState::Finished,
            _ => QueryState::ErrorState,
        }
    }

    fn name(self) -> &'static str {
        match self {
            QueryState::Created => "Created",
            QueryState::Deployed => "Deployed",
            QueryState::Running => "Running",
            QueryState::Stopped => "Stopped",
            QueryState::Finished => "Finished",
            QueryState::ErrorState => "ErrorState",
        }
    }
}

/// CAS-guarded state machine for one query (spec §4.5). Holds the query's last error
/// message, if any, for `status()` to report.
pub struct QueryLifecycle {
    query_id: QueryId,
    state: AtomicU8,
    error_message: Mutex<Option<String>>,
}

impl QueryLifecycle {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            state: AtomicU8::new(QueryState::Created as u8),
            error_message: Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueryState {
        QueryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().clone()
    }

    fn cas(&self, from: QueryState, to: QueryState) -> RuntimeResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RuntimeError::LifecycleViolation {
                query: self.query_id,
                from: from.name(),
                to: to.name(),
            })
    }

    /// `Created -> Deployed`: operator handlers allocated, sinks opened.
    pub fn setup(&self) -> RuntimeResult<()> {
        self.cas(QueryState::Created, QueryState::Deployed)
    }

    /// `Deployed -> Running`: source threads launched.
    pub fn start(&self) -> RuntimeResult<()> {
        self.cas(QueryState::Deployed, QueryState::Running)
    }

    /// `Running | Deployed -> Stopped`. Idempotent: already-terminal states return
    /// `Ok` without changing anything (spec §8 "stop(q); stop(q)").
    pub fn stop(&self) -> RuntimeResult<()> {
        match self.state() {
            QueryState::Stopped | QueryState::Finished | QueryState::ErrorState => Ok(()),
            QueryState::Running => self.cas(QueryState::Running, QueryState::Stopped),
            QueryState::Deployed => self.cas(QueryState::Deployed, QueryState::Stopped),
            QueryState::Created => Err(RuntimeError::LifecycleViolation {
                query: self.query_id,
                from: "Created",
                to: "Stopped",
            }),
        }
    }

    /// `Running -> Finished`: all sources drained gracefully (end-of-stream, not an
    /// explicit `stop`).
    pub fn finish(&self) -> RuntimeResult<()> {
        self.cas(QueryState::Running, QueryState::Finished)
    }

    /// Any state may transition to `ErrorState` (spec §4.5 "Failure semantics").
    pub fn fail(&self, message: impl Into<String>) {
        *self.error_message.lock() = Some(message.into());
        self.state.store(QueryState::ErrorState as u8, Ordering::Release);
    }
}

/// Per-query cancellation signal plus the teardown rendezvous (spec §4.5
/// "Cancellation"): every in-flight task and source thread holds a [`CallbackRef`]
/// cloned from this struct's keep-alive slot; `request_stop` drops the engine's own
/// placeholder reference and then blocks (via `CallbackOwner`'s destructor) until the
/// last holder's drop has run the teardown closure.
pub struct QuerySignals {
    stop_requested: AtomicBool,
    owner: Mutex<Option<CallbackOwner>>,
    keep_alive: Mutex<Option<CallbackRef>>,
}

impl QuerySignals {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        let (owner, guard) = Callback::create();
        owner.set_callback(teardown);
        Self {
            stop_requested: AtomicBool::new(false),
            owner: Mutex::new(Some(owner)),
            keep_alive: Mutex::new(Some(guard)),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Hands out a new guard for a source or task about to start. Returns `None` once
    /// stop has begun; callers must not admit new work in that case.
    pub fn task_guard(&self) -> Option<CallbackRef> {
        if self.stop_requested() {
            return None;
        }
        self.keep_alive.lock().clone()
    }

    /// Signals stop to every holder and blocks until the last one drops and teardown
    /// has run (or was cancelled, if no guard was ever issued). Safe to call more than
    /// once; the second call is a no-op.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.keep_alive.lock().take();
        if let Some(owner) = self.owner.lock().take() {
            drop(owner);
        }
    }
}
