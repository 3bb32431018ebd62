//! Fork handles: the completion slot a carrier writes into and the join
//! surface the rest of the scope sees.
//!
//! Joining is a suspension point: a parked joiner is woken either by the
//! fork completing or by its own carrier being interrupted.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

use parking_lot::Mutex;
use thiserror::Error;

use crate::interrupt::{self, Interrupted};

/// How a fork ended.
pub(super) enum ForkOutcome<T> {
    Value(T),
    /// Held panic (unsupervised fork, or the supervisor already had a
    /// failure); re-raised to the joiner.
    Panicked(Box<dyn Any + Send + 'static>),
    /// The fork's failure was taken by the supervisor, or the fork was torn
    /// down by cancellation.
    Interrupted,
}

pub(super) struct ForkSlot<T> {
    outcome: Mutex<Option<ForkOutcome<T>>>,
    joiners: Mutex<Vec<Thread>>,
}

impl<T> ForkSlot<T> {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            joiners: Mutex::new(Vec::new()),
        })
    }

    pub(super) fn complete(&self, outcome: ForkOutcome<T>) {
        *self.outcome.lock() = Some(outcome);
        for joiner in self.joiners.lock().drain(..) {
            joiner.unpark();
        }
    }

    /// Completes only if nothing was recorded yet (teardown fallback).
    pub(super) fn complete_if_empty(&self, outcome: ForkOutcome<T>) {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        for joiner in self.joiners.lock().drain(..) {
            joiner.unpark();
        }
    }

    /// Parks until the fork completes or the joiner is interrupted.
    fn join_wait(&self) -> Result<ForkOutcome<T>, Interrupted> {
        self.joiners.lock().push(thread::current());
        let intr = interrupt::current();
        loop {
            if let Some(outcome) = self.outcome.lock().take() {
                return Ok(outcome);
            }
            if intr.is_set() {
                return Err(Interrupted);
            }
            thread::park();
        }
    }
}

/// Failed [`Fork::join_either`].
#[derive(Error)]
pub enum JoinError {
    /// The fork was torn down (or the joiner interrupted) before producing
    /// a value.
    #[error("fork interrupted")]
    Interrupted,
    /// The fork panicked and the panic is held here.
    #[error("fork panicked")]
    Panicked(Box<dyn Any + Send + 'static>),
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Interrupted => f.write_str("Interrupted"),
            JoinError::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

impl From<Interrupted> for JoinError {
    fn from(_: Interrupted) -> Self {
        JoinError::Interrupted
    }
}

/// Handle to a running fork. Obtained from the `fork*` methods of
/// [`Scope`](super::Scope); bound to the scope's lifetime.
pub struct Fork<'scope, T> {
    pub(super) slot: Arc<ForkSlot<T>>,
    pub(super) _scope: PhantomData<&'scope ()>,
}

impl<T> Fork<'_, T> {
    /// Blocks until the fork completes and returns its value. A panic
    /// captured inside the fork is re-raised here; a fork consumed by scope
    /// teardown (or an interrupt of the joiner itself) yields
    /// `Err(Interrupted)`.
    pub fn join(self) -> Result<T, Interrupted> {
        match self.slot.join_wait()? {
            ForkOutcome::Value(v) => Ok(v),
            ForkOutcome::Panicked(p) => panic::resume_unwind(p),
            ForkOutcome::Interrupted => Err(Interrupted),
        }
    }

    /// Like [`join`](Self::join), but returns the fork's panic as a value
    /// instead of re-raising it.
    pub fn join_either(self) -> Result<T, JoinError> {
        match self.slot.join_wait()? {
            ForkOutcome::Value(v) => Ok(v),
            ForkOutcome::Panicked(p) => Err(JoinError::Panicked(p)),
            ForkOutcome::Interrupted => Err(JoinError::Interrupted),
        }
    }
}

/// Handles of a batch of user forks, joined together.
pub struct ForkAll<'scope, T> {
    pub(super) forks: Vec<Fork<'scope, T>>,
}

impl<T> ForkAll<'_, T> {
    /// Joins every fork, in spawn order.
    pub fn join(self) -> Result<Vec<T>, Interrupted> {
        self.forks.into_iter().map(Fork::join).collect()
    }
}

/// Wake-on-cancel (or completion) signal shared between a cancellable
/// fork's host carrier and its handle.
pub(super) struct CancelSignal {
    flag: AtomicBool,
    host: Mutex<Option<Thread>>,
}

impl CancelSignal {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            host: Mutex::new(None),
        })
    }

    pub(super) fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(super) fn signal(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(host) = self.host.lock().take() {
            host.unpark();
        }
    }

    /// Parks the host until cancelled, the worker completes, or the host's
    /// own carrier is interrupted (outer scope teardown).
    pub(super) fn wait(&self) {
        *self.host.lock() = Some(thread::current());
        let intr = interrupt::current();
        loop {
            if self.is_signalled() || intr.is_set() {
                return;
            }
            thread::park();
        }
    }
}

/// A fork with isolated interruptibility: it runs inside a nested scope on
/// its own pair of carriers, so cancelling it never disturbs the outer
/// scope's supervisor.
pub struct CancellableFork<'scope, T> {
    pub(super) slot: Arc<ForkSlot<T>>,
    pub(super) signal: Arc<CancelSignal>,
    pub(super) _scope: PhantomData<&'scope ()>,
}

impl<T> CancellableFork<'_, T> {
    /// Requests cancellation and awaits termination. Returns the fork's
    /// value if it completed first, `Err(Interrupted)` if the cancellation
    /// won.
    pub fn cancel(self) -> Result<T, JoinError> {
        self.signal.signal();
        self.join_either()
    }

    /// Requests cancellation without waiting for the fork to terminate.
    pub fn cancel_now(&self) {
        self.signal.signal();
    }

    /// Blocks until the fork completes on its own (or is cancelled).
    pub fn join(self) -> Result<T, Interrupted> {
        match self.slot.join_wait()? {
            ForkOutcome::Value(v) => Ok(v),
            ForkOutcome::Panicked(p) => panic::resume_unwind(p),
            ForkOutcome::Interrupted => Err(Interrupted),
        }
    }

    pub fn join_either(self) -> Result<T, JoinError> {
        match self.slot.join_wait()? {
            ForkOutcome::Value(v) => Ok(v),
            ForkOutcome::Panicked(p) => Err(JoinError::Panicked(p)),
            ForkOutcome::Interrupted => Err(JoinError::Interrupted),
        }
    }
}
