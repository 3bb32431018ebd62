//! The supervisor decides when a scope ends.
//!
//! Supervised scopes end when the body and every user fork completed
//! successfully, or immediately when the first failure is recorded.
//! Unsupervised scopes never end on a fork's behalf: forks hold their
//! failures until joined.
//!
//! First failure wins. Later failures are counted as suppressed and logged;
//! the winner is what the scope surfaces at exit.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, Thread};

use parking_lot::Mutex;
use tracing::debug;

use crate::interrupt::InterruptHandle;

pub(crate) type PanicPayload = Box<dyn Any + Send + 'static>;

/// First recorded failure of a scope.
pub(crate) enum Failure {
    /// A fork (or the body) unwound.
    Panic(PanicPayload),
    /// A value-typed application error from an error-mode fork; downcast by
    /// `supervised_err` at the scope boundary.
    App(Box<dyn Any + Send + 'static>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// `scoped`: never ends the scope on behalf of a fork.
    Unsupervised,
    /// `supervised` / `supervised_err`.
    Supervised,
}

struct FailureSlot {
    first: Option<Failure>,
    suppressed: usize,
}

pub(crate) struct Supervisor {
    mode: Mode,
    /// User forks started but not yet succeeded.
    outstanding: AtomicUsize,
    body_done: AtomicBool,
    /// Scope end has been requested (failure or normal exit); carriers are
    /// being interrupted.
    cancelled: AtomicBool,
    failure: Mutex<FailureSlot>,
    /// Interrupt handles of every carrier in the scope, the scope thread
    /// included.
    carriers: Mutex<Vec<InterruptHandle>>,
    scope_thread: Thread,
}

impl Supervisor {
    /// Must be created on the scope thread.
    pub(crate) fn new(mode: Mode) -> Self {
        Self {
            mode,
            outstanding: AtomicUsize::new(0),
            body_done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(FailureSlot {
                first: None,
                suppressed: 0,
            }),
            carriers: Mutex::new(Vec::new()),
            scope_thread: thread::current(),
        }
    }

    /// Called by every carrier before it runs its body. A carrier that
    /// arrives after cancellation interrupts itself.
    pub(crate) fn register_carrier(&self, handle: InterruptHandle) {
        self.carriers.lock().push(handle.clone());
        if self.is_cancelled() {
            handle.set();
        }
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// User fork registered; the scope will not end normally before it
    /// completes.
    pub(crate) fn fork_starts(&self) {
        if self.mode == Mode::Supervised {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// User fork completed successfully.
    pub(crate) fn fork_success(&self) {
        if self.mode == Mode::Supervised
            && self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1
            && self.body_done.load(Ordering::SeqCst)
        {
            self.scope_thread.unpark();
        }
    }

    /// Records a fork's panic. `Ok` means the supervisor accepted it and is
    /// ending the scope; `Err` hands the payload back (either the scope is
    /// unsupervised, or a failure was already recorded — the caller
    /// re-raises through `join`).
    pub(crate) fn fork_exception(&self, payload: PanicPayload) -> Result<(), PanicPayload> {
        if self.mode == Mode::Unsupervised {
            return Err(payload);
        }
        self.record(Failure::Panic(payload)).map_err(|f| match f {
            Failure::Panic(p) => p,
            Failure::App(_) => unreachable!(),
        })
    }

    /// Records an application error. Always requests scope end on the first
    /// failure; later errors are suppressed.
    pub(crate) fn fork_app_error(&self, error: Box<dyn Any + Send + 'static>) {
        if self.record(Failure::App(error)).is_err() {
            debug!(target: "corral::scope", "suppressing application error after first failure");
        }
    }

    fn record(&self, failure: Failure) -> Result<(), Failure> {
        let mut slot = self.failure.lock();
        if slot.first.is_none() {
            slot.first = Some(failure);
            drop(slot);
            debug!(target: "corral::scope", "first failure recorded; ending scope");
            self.end_scope();
            Ok(())
        } else {
            slot.suppressed += 1;
            Err(failure)
        }
    }

    pub(crate) fn body_completed(&self) {
        self.body_done.store(true, Ordering::SeqCst);
    }

    /// Parks the scope thread until the scope may exit: cancellation, or
    /// body done with no outstanding user forks.
    pub(crate) fn await_end(&self) {
        loop {
            if self.is_cancelled()
                || (self.body_done.load(Ordering::SeqCst)
                    && self.outstanding.load(Ordering::SeqCst) == 0)
            {
                return;
            }
            thread::park();
        }
    }

    /// Interrupts every carrier (idempotent). Daemon forks are cancelled
    /// this way on normal scope exit too.
    pub(crate) fn end_scope(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.carriers.lock().iter() {
            handle.set();
        }
    }

    pub(crate) fn take_failure(&self) -> Option<Failure> {
        let mut slot = self.failure.lock();
        if slot.suppressed > 0 {
            debug!(
                target: "corral::scope",
                suppressed = slot.suppressed,
                "scope had failures beyond the first"
            );
        }
        slot.first.take()
    }
}
