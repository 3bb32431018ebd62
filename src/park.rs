//! Single-use parking slot ("continuation") used by the rendezvous channel.
//!
//! A continuation is created by the thread about to suspend and handed to the
//! opposite side through the owning cell. Exactly one of three things happens
//! to it, decided by a CAS on its state word:
//!
//! - the counterparty resumes it with a payload (`Pending → Resumed`),
//! - a channel close sweeps it (`Pending → Closed`),
//! - the owner wins the interrupt race (`Pending → Interrupted`).
//!
//! The payload travels through the continuation itself: the resumer writes it
//! *before* the `Resumed` CAS and reclaims it if the CAS loses, so the owner
//! only ever reads an initialized slot. After waking, the owner touches
//! nothing but this heap allocation, which both sides keep alive through
//! their own `Arc` — resumption never chases a freed cell.
//!
//! `park` spins a bounded number of iterations before the first park, since a
//! rendezvous partner is frequently only a few instructions away.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, Thread};

use crate::interrupt::{self, InterruptState};

const PENDING: u8 = 0;
const RESUMED: u8 = 1;
const INTERRUPTED: u8 = 2;
const CLOSED: u8 = 3;
/// Owner has taken the payload out of a `RESUMED` slot.
const CONSUMED: u8 = 4;

/// Iterations of `spin_loop` before the owner parks for the first time.
const SPIN_LIMIT: usize = 1000;

/// Outcome of [`Continuation::park`].
pub(crate) enum Parked<P> {
    /// The counterparty handed over `P`.
    Resumed(P),
    /// The owner was interrupted; the `on_interrupt` hook has already run.
    Interrupted,
    /// A channel close swept this waiter.
    Closed,
}

pub(crate) struct Continuation<P> {
    state: AtomicU8,
    payload: UnsafeCell<MaybeUninit<P>>,
    owner: Thread,
    /// Interrupt flag governing the owner at creation time.
    interrupt: Arc<InterruptState>,
}

// Safe: the payload slot is written by at most one resumer (exclusive by cell
// protocol) and read by the owner only after an Acquire load of RESUMED.
unsafe impl<P: Send> Send for Continuation<P> {}
unsafe impl<P: Send> Sync for Continuation<P> {}

impl<P> Continuation<P> {
    /// Must be called on the thread that will `park`.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            payload: UnsafeCell::new(MaybeUninit::uninit()),
            owner: thread::current(),
            interrupt: interrupt::current(),
        })
    }

    /// Hands `payload` to the parked owner and wakes it.
    ///
    /// Fails iff the owner already won the interrupt race or a close swept
    /// it first; the payload is handed back so the caller can retry at a
    /// fresh cell.
    pub(crate) fn try_resume(&self, payload: P) -> Result<(), P> {
        // The caller is the unique resumer (it swapped the waiter pointer out
        // of the cell), so the slot write cannot race another writer.
        unsafe { (*self.payload.get()).write(payload) };
        match self
            .state
            .compare_exchange(PENDING, RESUMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.owner.unpark();
                Ok(())
            }
            // Owner is gone; take the payload back out.
            Err(_) => Err(unsafe { (*self.payload.get()).assume_init_read() }),
        }
    }

    /// Wakes the owner with the closed marker instead of a payload.
    pub(crate) fn resume_closed(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.owner.unpark();
                true
            }
            Err(_) => false,
        }
    }

    /// Suspends the owner until one of the three transitions happens.
    ///
    /// On interrupt, `on_interrupt` runs after the `Interrupted` CAS is won;
    /// the channel uses it to publish the tombstone into the owning cell so
    /// the counterparty knows to retry elsewhere.
    pub(crate) fn park(&self, on_interrupt: impl FnOnce()) -> Parked<P> {
        debug_assert!(thread::current().id() == self.owner.id());

        let mut spins = 0;
        loop {
            match self.state.load(Ordering::Acquire) {
                RESUMED => {
                    let payload = unsafe { (*self.payload.get()).assume_init_read() };
                    self.state.store(CONSUMED, Ordering::Release);
                    return Parked::Resumed(payload);
                }
                CLOSED => return Parked::Closed,
                _ => {
                    if self.interrupt.is_set() {
                        if self
                            .state
                            .compare_exchange(
                                PENDING,
                                INTERRUPTED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            on_interrupt();
                            return Parked::Interrupted;
                        }
                        // Lost to a concurrent resume/close; the next load
                        // observes it.
                    } else if spins < SPIN_LIMIT {
                        spins += 1;
                        std::hint::spin_loop();
                    } else {
                        // Spurious unparks are fine: the loop re-checks.
                        thread::park();
                    }
                }
            }
        }
    }
}

impl<P> Drop for Continuation<P> {
    fn drop(&mut self) {
        // A resumed-but-never-consumed payload (owner raced away after an
        // interrupt loss it never observed) would otherwise leak.
        if *self.state.get_mut() == RESUMED {
            unsafe { (*self.payload.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Resume-before-park: the owner must still observe the payload.
    #[test]
    fn test_resume_then_park() {
        let k = Continuation::<i32>::new();
        k.try_resume(7).unwrap();
        match k.park(|| panic!("not interrupted")) {
            Parked::Resumed(v) => assert_eq!(v, 7),
            _ => panic!("expected resume"),
        }
    }

    /// A parked owner is woken by a resume from another thread.
    #[test]
    fn test_cross_thread_resume() {
        let (tx, rx) = std::sync::mpsc::channel();
        let owner = thread::spawn(move || {
            let k = Continuation::<String>::new();
            tx.send(Arc::clone(&k)).unwrap();
            match k.park(|| {}) {
                Parked::Resumed(v) => v,
                _ => panic!("expected resume"),
            }
        });
        let k = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        k.try_resume("hello".to_string()).unwrap();
        assert_eq!(owner.join().unwrap(), "hello");
    }

    /// Once the owner wins the interrupt race, resumers are refused and get
    /// their payload back.
    #[test]
    fn test_interrupt_wins() {
        let (tx, rx) = std::sync::mpsc::channel();
        let owner = thread::spawn(move || {
            let (handle, _guard) = crate::interrupt::register_current();
            let k = Continuation::<i32>::new();
            tx.send((Arc::clone(&k), handle)).unwrap();
            let mut hook_ran = false;
            let outcome = k.park(|| hook_ran = true);
            assert!(hook_ran);
            matches!(outcome, Parked::Interrupted)
        });
        let (k, handle) = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        handle.set();
        assert!(owner.join().unwrap());
        assert_eq!(k.try_resume(1), Err(1));
    }

    /// Close sweeps refuse later resumes.
    #[test]
    fn test_closed() {
        let k = Continuation::<i32>::new();
        assert!(k.resume_closed());
        assert!(!k.resume_closed());
        assert_eq!(k.try_resume(3), Err(3));
        assert!(matches!(k.park(|| {}), Parked::Closed));
    }
}
