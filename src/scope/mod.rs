//! Structured concurrency scopes.
//!
//! A scope is a lexical region owning a group of forks. Whatever happens —
//! success, panic, application error, cancellation — every carrier spawned
//! into the scope has terminated before the block returns, finalizers have
//! run (LIFO, uninterruptibly), and the outcome is surfaced exactly once.
//!
//! ```
//! use corral::supervised;
//!
//! let sum = supervised(|scope| {
//!     let a = scope.fork_user(|| 1 + 2);
//!     let b = scope.fork_user(|| 4 + 5);
//!     a.join().unwrap() + b.join().unwrap()
//! });
//! assert_eq!(sum, 12);
//! ```
//!
//! ## Fork flavors
//!
//! | API | Supervised? | Scope awaits it? | Failure behavior |
//! |---|---|---|---|
//! | [`Scope::fork`] | yes (daemon) | no | panic ends the scope |
//! | [`Scope::fork_user`] | yes | yes | panic ends the scope |
//! | [`Scope::fork_unsupervised`] | no | no | held until `join` |
//! | [`ErrScope::fork_err`] | yes (error mode) | no | app error ends the scope |
//! | [`ErrScope::fork_user_err`] | yes (error mode) | yes | app error ends the scope |
//! | [`Scope::fork_cancellable`] | nested scope | no | explicit cancel |
//!
//! ## Cancellation
//!
//! Cooperative: ending the scope sets every carrier's interrupt flag and
//! unparks it; the next suspension point returns
//! [`Interrupted`](crate::Interrupted). The scope thread itself is
//! interrupted the same way, so a body blocked on a channel or a join backs
//! out too. Carriers are OS threads (via [`std::thread::scope`]), which
//! also guarantees the scope cannot exit before every fork terminated.

mod fork;
mod supervisor;

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::trace;

use crate::error_mode::ErrorMode;
use crate::interrupt;

pub use fork::{CancellableFork, Fork, ForkAll, JoinError};
use fork::{CancelSignal, ForkOutcome, ForkSlot};
use supervisor::{Failure, Mode, PanicPayload, Supervisor};

type Finalizer<'env> = Box<dyn FnOnce() + Send + 'env>;

pub(crate) struct ScopeState<'env> {
    supervisor: Supervisor,
    finalizers: Mutex<Vec<Finalizer<'env>>>,
}

/// Capability handle for a running scope. `Copy`, so fork bodies capture it
/// by value and can spawn further forks.
pub struct Scope<'scope, 'env: 'scope> {
    ts: &'scope thread::Scope<'scope, 'env>,
    state: &'scope ScopeState<'env>,
}

impl<'scope, 'env> Clone for Scope<'scope, 'env> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'scope, 'env> Copy for Scope<'scope, 'env> {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ForkKind {
    Daemon,
    User,
    Unsupervised,
}

impl<'scope, 'env> Scope<'scope, 'env> {
    /// Spawns a supervised daemon fork: its panic ends the scope, but the
    /// scope does not wait for it — it is interrupted at scope exit.
    pub fn fork<T, F>(&self, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        self.spawn(ForkKind::Daemon, f)
    }

    /// Spawns a supervised user fork: the scope's normal exit awaits its
    /// completion.
    pub fn fork_user<T, F>(&self, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        self.spawn(ForkKind::User, f)
    }

    /// Spawns an unsupervised fork: failures are held in the fork and only
    /// surface on `join`.
    pub fn fork_unsupervised<T, F>(&self, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        self.spawn(ForkKind::Unsupervised, f)
    }

    /// Spawns a batch of user forks.
    pub fn fork_all<T, F, I>(&self, bodies: I) -> ForkAll<'scope, T>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        ForkAll {
            forks: bodies.into_iter().map(|f| self.fork_user(f)).collect(),
        }
    }

    /// Spawns a fork with isolated interruptibility: a nested scope on the
    /// fork's own carrier pair, collapsed by [`CancellableFork::cancel`].
    /// Costs two carriers, but cancelling it leaves this scope's supervisor
    /// untouched.
    pub fn fork_cancellable<T, F>(&self, f: F) -> CancellableFork<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        let slot = ForkSlot::new();
        let signal = CancelSignal::new();
        let worker_slot = Arc::clone(&slot);
        let worker_signal = Arc::clone(&signal);
        self.spawn(ForkKind::Unsupervised, move || {
            scoped(|inner| {
                let slot = Arc::clone(&worker_slot);
                let signal = Arc::clone(&worker_signal);
                inner.fork_unsupervised(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(f));
                    match result {
                        Ok(v) => slot.complete(ForkOutcome::Value(v)),
                        // An unwind after the cancel signal (or during outer
                        // teardown) is cancellation, not a failure.
                        Err(_) if signal.is_signalled() || interrupt::is_interrupted() => {
                            slot.complete(ForkOutcome::Interrupted);
                        }
                        Err(p) => slot.complete(ForkOutcome::Panicked(p)),
                    }
                    signal.signal();
                });
                // Parks until cancel, worker completion, or outer teardown;
                // leaving the nested scope interrupts the worker.
                worker_signal.wait();
            });
            // Worker torn down before it could publish (e.g. outer scope
            // cancellation): leave an outcome for any joiner.
            worker_slot.complete_if_empty(ForkOutcome::Interrupted);
        });
        CancellableFork {
            slot,
            signal,
            _scope: PhantomData,
        }
    }

    /// Registers a finalizer. Finalizers run on the scope thread after
    /// every fork has terminated, in reverse registration order, with
    /// interrupts masked.
    pub fn defer(&self, f: impl FnOnce() + Send + 'env) {
        self.state.finalizers.lock().push(Box::new(f));
    }

    fn spawn<T, F>(&self, kind: ForkKind, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        let slot = ForkSlot::new();
        let state = self.state;
        if kind == ForkKind::User {
            // Before the spawn, so the scope cannot end in the gap.
            state.supervisor.fork_starts();
        }
        let carrier_slot = Arc::clone(&slot);
        self.ts.spawn(move || {
            let (handle, _guard) = interrupt::register_current();
            state.supervisor.register_carrier(handle);
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            match result {
                Ok(v) => {
                    if kind == ForkKind::User {
                        state.supervisor.fork_success();
                    }
                    carrier_slot.complete(ForkOutcome::Value(v));
                }
                Err(payload) => complete_panicked(state, kind, &carrier_slot, payload),
            }
        });
        Fork {
            slot,
            _scope: PhantomData,
        }
    }
}

/// Error-mode capability: handed to `supervised_err` bodies so application
/// errors always have a scope that can return them. Derefs to [`Scope`].
pub struct ErrScope<'scope, 'env: 'scope, M, E> {
    scope: Scope<'scope, 'env>,
    mode: M,
    _error: PhantomData<fn() -> E>,
}

impl<'scope, 'env, M: Copy, E> Clone for ErrScope<'scope, 'env, M, E> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'scope, 'env, M: Copy, E> Copy for ErrScope<'scope, 'env, M, E> {}

impl<'scope, 'env, M, E> std::ops::Deref for ErrScope<'scope, 'env, M, E> {
    type Target = Scope<'scope, 'env>;

    fn deref(&self) -> &Scope<'scope, 'env> {
        &self.scope
    }
}

impl<'scope, 'env, M, E> ErrScope<'scope, 'env, M, E>
where
    M: ErrorMode<E>,
    E: Send + 'static,
{
    /// Spawns a daemon fork whose application error ends the scope. The
    /// error is returned (never thrown) from `supervised_err`.
    pub fn fork_err<T, F>(&self, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> M::Container<T> + Send + 'scope,
        T: Send + 'scope,
        M::Container<T>: Send + 'scope,
    {
        self.spawn_err(ForkKind::Daemon, f)
    }

    /// Spawns a user fork whose application error ends the scope.
    pub fn fork_user_err<T, F>(&self, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> M::Container<T> + Send + 'scope,
        T: Send + 'scope,
        M::Container<T>: Send + 'scope,
    {
        self.spawn_err(ForkKind::User, f)
    }

    fn spawn_err<T, F>(&self, kind: ForkKind, f: F) -> Fork<'scope, T>
    where
        F: FnOnce() -> M::Container<T> + Send + 'scope,
        T: Send + 'scope,
    {
        let mode = self.mode;
        let state = self.scope.state;
        let slot = ForkSlot::new();
        if kind == ForkKind::User {
            state.supervisor.fork_starts();
        }
        let carrier_slot = Arc::clone(&slot);
        self.scope.ts.spawn(move || {
            let (handle, _guard) = interrupt::register_current();
            state.supervisor.register_carrier(handle);
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(container) => {
                    if mode.is_error(&container) {
                        // The error ends the scope; the joiner (if any)
                        // observes teardown. No fork_success: the scope is
                        // not exiting normally anymore.
                        state
                            .supervisor
                            .fork_app_error(Box::new(mode.get_error(container)));
                        carrier_slot.complete(ForkOutcome::Interrupted);
                    } else {
                        if kind == ForkKind::User {
                            state.supervisor.fork_success();
                        }
                        carrier_slot.complete(ForkOutcome::Value(mode.get_value(container)));
                    }
                }
                Err(payload) => {
                    complete_panicked(state, kind, &carrier_slot, payload);
                }
            }
        });
        Fork {
            slot,
            _scope: PhantomData,
        }
    }
}

/// Shared panic handling for supervised fork carriers.
fn complete_panicked<T>(
    state: &ScopeState<'_>,
    kind: ForkKind,
    slot: &ForkSlot<T>,
    payload: PanicPayload,
) {
    match kind {
        ForkKind::Unsupervised => slot.complete(ForkOutcome::Panicked(payload)),
        ForkKind::Daemon | ForkKind::User => {
            if state.supervisor.is_cancelled() {
                // Teardown casualty, not a failure.
                slot.complete(ForkOutcome::Interrupted);
            } else {
                match state.supervisor.fork_exception(payload) {
                    Ok(()) => slot.complete(ForkOutcome::Interrupted),
                    Err(payload) => slot.complete(ForkOutcome::Panicked(payload)),
                }
            }
        }
    }
}

/// Runs `body` in an unsupervised scope: forks hold their own failures, the
/// scope ends when the body returns, and still-running forks are then
/// interrupted and awaited.
pub fn scoped<'env, T, F>(body: F) -> T
where
    F: for<'scope> FnOnce(Scope<'scope, 'env>) -> T,
{
    let (value, held, finalizer_panic, failure) = enter(Mode::Unsupervised, body);
    debug_assert!(failure.is_none());
    if let Some(p) = held {
        panic::resume_unwind(p);
    }
    if let Some(p) = finalizer_panic {
        panic::resume_unwind(p);
    }
    match value {
        Some(v) => v,
        None => unreachable!("no value and no panic"),
    }
}

/// Runs `body` in a supervised scope: the scope ends when the body and all
/// user forks completed, or at the first failure, which is re-raised here
/// after every fork has terminated and finalizers have run.
pub fn supervised<'env, T, F>(body: F) -> T
where
    F: for<'scope> FnOnce(Scope<'scope, 'env>) -> T,
{
    let (value, _held, finalizer_panic, failure) = enter(Mode::Supervised, body);
    match failure {
        Some(Failure::Panic(p)) => panic::resume_unwind(p),
        Some(Failure::App(_)) => {
            unreachable!("application error in a scope without an error mode")
        }
        None => {}
    }
    if let Some(p) = finalizer_panic {
        panic::resume_unwind(p);
    }
    match value {
        Some(v) => v,
        None => unreachable!("no value and no failure"),
    }
}

/// Runs `body` in a supervised scope under an error mode: application
/// errors (from the body or from `fork_err`/`fork_user_err`) end the scope
/// and are returned in the mode's container.
pub fn supervised_err<'env, M, E, T, F>(mode: M, body: F) -> M::Container<T>
where
    M: ErrorMode<E>,
    E: Send + 'static,
    F: for<'scope> FnOnce(ErrScope<'scope, 'env, M, E>) -> M::Container<T>,
{
    let (value, _held, finalizer_panic, failure) = enter(Mode::Supervised, |scope| {
        let err_scope = ErrScope {
            scope,
            mode,
            _error: PhantomData,
        };
        let container = body(err_scope);
        if mode.is_error(&container) {
            scope
                .state
                .supervisor
                .fork_app_error(Box::new(mode.get_error(container)));
            None
        } else {
            Some(container)
        }
    });
    match failure {
        Some(Failure::Panic(p)) => panic::resume_unwind(p),
        Some(Failure::App(error)) => match error.downcast::<E>() {
            Ok(e) => return mode.pure_error(*e),
            Err(_) => unreachable!("application error of a foreign type"),
        },
        None => {}
    }
    if let Some(p) = finalizer_panic {
        panic::resume_unwind(p);
    }
    match value.flatten() {
        Some(container) => container,
        None => unreachable!("no container and no failure"),
    }
}

/// Shared scope driver. Returns the body's value (if it produced one), a
/// held body panic (unsupervised scopes only), a finalizer panic, and the
/// recorded failure.
#[allow(clippy::type_complexity)]
fn enter<'env, T, F>(
    mode: Mode,
    body: F,
) -> (
    Option<T>,
    Option<PanicPayload>,
    Option<PanicPayload>,
    Option<Failure>,
)
where
    F: for<'scope> FnOnce(Scope<'scope, 'env>) -> T,
{
    let state = ScopeState {
        supervisor: Supervisor::new(mode),
        finalizers: Mutex::new(Vec::new()),
    };

    let (value, held) = thread::scope(|ts| {
        let (handle, _guard) = interrupt::register_current();
        state.supervisor.register_carrier(handle);
        let scope = Scope { ts, state: &state };

        let (value, body_panic) = match panic::catch_unwind(AssertUnwindSafe(|| body(scope))) {
            Ok(v) => (Some(v), None),
            Err(p) => (None, Some(p)),
        };

        let held = match (mode, body_panic) {
            (_, None) => None,
            (Mode::Supervised, Some(p)) => {
                // Consumed either way: accepted as the scope failure, or
                // counted as suppressed behind an earlier one.
                let _ = state.supervisor.fork_exception(p);
                None
            }
            (Mode::Unsupervised, Some(p)) => Some(p),
        };

        state.supervisor.body_completed();
        state.supervisor.await_end();
        trace!(target: "corral::scope", "scope ending; cancelling remaining forks");
        state.supervisor.end_scope();
        (value, held)
        // std::thread::scope joins every carrier here.
    });

    // All children have terminated; run finalizers LIFO, uninterruptibly.
    let finalizer_panic = {
        let _mask = interrupt::mask();
        let mut first_panic = None;
        loop {
            let Some(finalizer) = state.finalizers.lock().pop() else {
                break;
            };
            if let Err(p) = panic::catch_unwind(AssertUnwindSafe(finalizer)) {
                if first_panic.is_none() {
                    first_panic = Some(p);
                } else {
                    trace!(target: "corral::scope", "suppressing later finalizer panic");
                }
            }
        }
        first_panic
    };

    let failure = state.supervisor.take_failure();
    (value, held, finalizer_panic, failure)
}
