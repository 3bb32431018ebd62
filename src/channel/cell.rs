//! One rendezvous cell: an atomic state word, a value slot, and a parked
//! waiter pointer.
//!
//! State transitions are CAS-only and terminal states are monotone — once a
//! cell is `DONE`, `BROKEN`, `INTERRUPTED` or `CLOSED` it never changes
//! again. The value and waiter slots are plain memory whose ownership is
//! arbitrated entirely through the state word and the waiter pointer swap:
//!
//! - the value slot is written by the (unique) sender of this cell before the
//!   state CAS that publishes it, and read by exactly one party afterwards;
//! - the waiter pointer holds one strong `Arc` reference owned by the cell;
//!   whoever `swap`s it out inherits that reference.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::park::Continuation;

/// Unclaimed, or claimed but not yet published.
pub(super) const EMPTY: u8 = 0;
/// A sender stored its value without suspending (buffered-eligible cell).
pub(super) const BUFFERED: u8 = 1;
/// A sender parked here; value slot holds its value, waiter its continuation.
pub(super) const SEND_WAITER: u8 = 2;
/// A receiver parked here; waiter holds its continuation.
pub(super) const RECV_WAITER: u8 = 3;
/// Terminal: the value was handed over exactly once.
pub(super) const DONE: u8 = 4;
/// Terminal: one side abandoned the cell; the other must retry elsewhere.
pub(super) const BROKEN: u8 = 5;
/// Terminal: the parked party was interrupted and tombstoned its cell.
pub(super) const INTERRUPTED: u8 = 6;
/// Terminal: a channel close swept or reclaimed this cell.
pub(super) const CLOSED: u8 = 7;

pub(super) struct Cell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    waiter: AtomicPtr<()>,
}

impl<T> Cell<T> {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub(super) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Single CAS step of the cell state machine.
    #[inline]
    pub(super) fn cas_state(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Writes the sender's value.
    ///
    /// # Safety
    /// Caller must hold exclusive claim on the slot (before publishing the
    /// state, or after winning the arbitration that grants reclaim). Any
    /// previous value is overwritten without being dropped.
    #[inline]
    pub(super) unsafe fn write_value(&self, value: T) {
        unsafe { (*self.value.get()).write(value) };
    }

    /// Moves the value out of the slot.
    ///
    /// # Safety
    /// The slot must be initialized and the caller must be the arbitration
    /// winner — the value is read exactly once.
    #[inline]
    pub(super) unsafe fn read_value(&self) -> T {
        unsafe { (*self.value.get()).assume_init_read() }
    }

    /// Parks `k` in this cell. The cell owns one strong reference until a
    /// `take_waiter` swaps it out.
    pub(super) fn install_waiter<P>(&self, k: Arc<Continuation<P>>) {
        self.waiter
            .store(Arc::into_raw(k) as *mut (), Ordering::Release);
    }

    /// Takes the parked continuation, inheriting the cell's reference.
    /// Returns `None` if another party (resumer, close sweep, or the waiter
    /// itself on interrupt) already took it.
    ///
    /// # Safety
    /// `P` must match the installed continuation's payload type; the cell
    /// state (`SEND_WAITER` vs `RECV_WAITER`) determines it.
    pub(super) unsafe fn take_waiter<P>(&self) -> Option<Arc<Continuation<P>>> {
        let p = self.waiter.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            None
        } else {
            Some(unsafe { Arc::from_raw(p as *const Continuation<P>) })
        }
    }

    /// Releases whatever the cell still owns.
    ///
    /// # Safety
    /// Only from the channel's `Drop`: no concurrent access of any kind.
    pub(super) unsafe fn drop_contents(&self) {
        match self.state.load(Ordering::Relaxed) {
            BUFFERED => unsafe { (*self.value.get()).assume_init_drop() },
            // A parked waiter cannot outlive the channel (it borrows it for
            // the whole call), but a cell may still hold a reference that
            // was never swapped out.
            SEND_WAITER => unsafe {
                drop(self.take_waiter::<()>());
                (*self.value.get()).assume_init_drop();
            },
            RECV_WAITER => unsafe {
                drop(self.take_waiter::<T>());
            },
            _ => {}
        }
    }
}
