//! Cooperative interrupts for carrier threads.
//!
//! There is no preemptive cancellation: a scope that wants a fork gone sets
//! the fork's interrupt flag and unparks its carrier. Every suspension point
//! (channel send/receive, [`Fork::join`](crate::scope::Fork::join), the
//! schedule engine's sleep, rate-limiter acquire) re-checks the flag after
//! waking and surfaces [`Interrupted`] to its caller.
//!
//! Flags are looked up through a thread-local stack: entering a scope pushes
//! the scope's flag on the scope thread, and every carrier pushes its own
//! flag before running the fork body. A thread outside any scope gets a
//! per-thread flag that nothing ever sets, so channels and sleeps work there
//! too.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use thiserror::Error;

/// The current carrier was interrupted while suspended (its scope is being
/// cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// One carrier's interrupt flag plus the handle needed to wake it.
pub(crate) struct InterruptState {
    flag: AtomicBool,
    /// The thread that registered this state; `set` unparks it so a parked
    /// suspension point re-checks the flag.
    thread: Thread,
}

impl InterruptState {
    fn for_current_thread() -> Self {
        Self {
            flag: AtomicBool::new(false),
            thread: thread::current(),
        }
    }

    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Idempotent: interrupting an already-interrupted (or finished) carrier
    /// is a no-op beyond a spurious unpark, which every waiter tolerates.
    pub(crate) fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Scope-held handle to interrupt one carrier.
#[derive(Clone)]
pub(crate) struct InterruptHandle(Arc<InterruptState>);

impl InterruptHandle {
    pub(crate) fn set(&self) {
        self.0.set();
    }
}

thread_local! {
    /// Innermost-scope-last stack of interrupt states governing this thread.
    static CONTEXT: RefCell<Vec<Arc<InterruptState>>> = const { RefCell::new(Vec::new()) };

    /// Fallback state for threads running outside any scope. Never set.
    static UNSCOPED: Arc<InterruptState> =
        Arc::new(InterruptState::for_current_thread());
}

/// The interrupt state governing the current thread.
pub(crate) fn current() -> Arc<InterruptState> {
    CONTEXT
        .with(|ctx| ctx.borrow().last().cloned())
        .unwrap_or_else(|| UNSCOPED.with(Arc::clone))
}

/// True iff the innermost governing flag is set.
pub(crate) fn is_interrupted() -> bool {
    current().is_set()
}

/// Pops the pushed state when the registration frame unwinds.
pub(crate) struct ContextGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            ctx.borrow_mut().pop();
        });
    }
}

fn push(state: Arc<InterruptState>) -> ContextGuard {
    CONTEXT.with(|ctx| ctx.borrow_mut().push(state));
    ContextGuard {
        _not_send: std::marker::PhantomData,
    }
}

/// Registers a fresh interruptible state for the current thread and returns
/// the handle a scope uses to interrupt it.
pub(crate) fn register_current() -> (InterruptHandle, ContextGuard) {
    let state = Arc::new(InterruptState::for_current_thread());
    let handle = InterruptHandle(Arc::clone(&state));
    (handle, push(state))
}

/// Masks interrupts for the current thread until the guard drops.
///
/// Finalizers run under this: the pushed state is never set, so suspension
/// points inside them do not observe the dying scope's flag.
pub(crate) fn mask() -> ContextGuard {
    push(Arc::new(InterruptState::for_current_thread()))
}

/// Interruptible sleep.
///
/// Returns `Err(Interrupted)` as soon as the governing flag is observed,
/// which may be well before `duration` has elapsed. Spurious unparks are
/// tolerated by re-checking the deadline in a loop.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    let state = current();
    let deadline = Instant::now() + duration;
    loop {
        if state.is_set() {
            return Err(Interrupted);
        }
        match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) if !remaining.is_zero() => thread::park_timeout(remaining),
            _ => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A thread outside any scope sleeps the full duration.
    #[test]
    fn test_sleep_uninterrupted() {
        let started = Instant::now();
        sleep(Duration::from_millis(20)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    /// Setting the registered flag wakes a parked sleeper early.
    #[test]
    fn test_sleep_interrupted() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sleeper = thread::spawn(move || {
            let (handle, _guard) = register_current();
            tx.send(handle).unwrap();
            sleep(Duration::from_secs(60))
        });
        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        handle.set();
        assert_eq!(sleeper.join().unwrap(), Err(Interrupted));
    }

    /// The innermost registration wins; popping restores the outer state.
    #[test]
    fn test_nested_contexts() {
        let (outer, _outer_guard) = register_current();
        {
            let (_inner, _inner_guard) = register_current();
            outer.set();
            // The inner state is untouched by the outer handle.
            assert!(!is_interrupted());
        }
        assert!(is_interrupted());
    }

    /// A masked region ignores the surrounding interrupt.
    #[test]
    fn test_mask() {
        let (handle, _guard) = register_current();
        handle.set();
        assert!(is_interrupted());
        {
            let _mask = mask();
            assert!(!is_interrupted());
            sleep(Duration::from_millis(1)).unwrap();
        }
        assert!(is_interrupted());
    }
}
