//! Lock-Free Rendezvous Channel
//!
//! An unbuffered-or-buffered channel that pairs senders and receivers
//! through a logically unbounded array of one-shot cells. Each side claims
//! the next cell index with a fetch-add on its own sequence counter and then
//! drives that cell's state machine; pairing is by index, so the channel is
//! FIFO per side and a single thread's sends are observed in program order.
//!
//! ## Cell state machine
//!
//! Decision table for a sender at cell `s` with receiver counter snapshot
//! `r` and buffer capacity `B`:
//!
//! | Cell state | Condition | Action |
//! |---|---|---|
//! | `Empty` | `s < r + B` | CAS `Empty → Buffered(v)`; done |
//! | `Empty` | `s ≥ r + B` | CAS `Empty → SendWaiter(v, k)`, park |
//! | `RecvWaiter(k)` | — | `k.try_resume(v)`; won → `Done`, lost → `Broken`, retry |
//! | `Broken` / `Interrupted` / `Closed` | — | claim a fresh index and retry |
//!
//! Receive is symmetric: `Buffered`/`SendWaiter` yield a value, an `Empty`
//! cell already claimed by a sender (`r < s`) is marked `Broken` after a
//! short grace spin (forcing both sides to a fresh index), and an `Empty`
//! cell with no sender parks a `RecvWaiter`.
//!
//! Terminal states (`Done`, `Broken`, `Interrupted`, `Closed`) are monotone,
//! at most one continuation ever parks per cell, and a value is delivered
//! exactly once — whoever wins the single CAS that consumes it.
//!
//! ## Synchronization
//!
//! No locks. The protocol relies on:
//!
//! | Operation | Ordering | Purpose |
//! |-----------|----------|---------|
//! | Sequence counters, closed flag | `SeqCst` | close sweep vs. late claimants (Dekker) |
//! | Cell state CAS | `AcqRel` | publishes the value/waiter slots it guards |
//! | Waiter pointer swap | `AcqRel` | unique ownership of the parked continuation |
//!
//! ## Cancellation
//!
//! A parked party whose carrier is interrupted wins the continuation race,
//! tombstones its cell (`Interrupted`) and reclaims its value; the
//! counterparty observes the tombstone and retries at a fresh index — its
//! counter was already advanced, so the index cannot be taken back.
//!
//! ## Closure
//!
//! [`done`](Channel::done) and [`error`](Channel::error) publish a closed
//! reason once (first close wins), then sweep the parked range and resume
//! every waiter with the closed marker. After `done`, buffered values drain
//! through [`receive_or_closed`](Channel::receive_or_closed), which then
//! yields the done marker forever; after `error`, every receive observes the
//! error.

mod cell;
mod error;
mod segment;

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use crossbeam_utils::CachePadded;

pub use error::{ChannelClosed, RecvError, SendError, TrySendError};

use crate::park::{Continuation, Parked};
use cell::{BROKEN, BUFFERED, CLOSED, DONE, EMPTY, INTERRUPTED, RECV_WAITER, SEND_WAITER};
use segment::Segment;

/// Spins granted to a sender that claimed a cell but has not yet published
/// its value, before the receiver breaks the cell and moves on.
const MATERIALIZE_SPIN: usize = 128;

pub struct Channel<T> {
    /// Next cell index on the send side.
    senders: CachePadded<AtomicU64>,
    /// Next cell index on the receive side.
    receivers: CachePadded<AtomicU64>,
    head: ArcSwap<Segment<T>>,
    /// `B`: cell `s` may buffer iff `s < receivers + B`.
    capacity: u64,
    closed_flag: CachePadded<AtomicBool>,
    closed: OnceLock<ChannelClosed>,
}

// Safe: value slots hand `T` across threads under the cell CAS protocol;
// no `&T` is ever shared between threads, so `T: Sync` is not required.
unsafe impl<T: Send> Send for Channel<T> {}
unsafe impl<T: Send> Sync for Channel<T> {}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::rendezvous()
    }
}

impl<T> Channel<T> {
    /// A capacity-0 channel: every send meets its receiver.
    pub fn rendezvous() -> Self {
        Self::with_capacity(0)
    }

    /// A channel whose senders may run `capacity` cells ahead of the
    /// receivers before blocking.
    pub fn buffered(capacity: usize) -> Self {
        Self::with_capacity(capacity as u64)
    }

    fn with_capacity(capacity: u64) -> Self {
        Self {
            senders: CachePadded::new(AtomicU64::new(0)),
            receivers: CachePadded::new(AtomicU64::new(0)),
            head: ArcSwap::new(Segment::new(0)),
            capacity,
            closed_flag: CachePadded::new(AtomicBool::new(false)),
            closed: OnceLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    fn closed_reason(&self) -> Option<&ChannelClosed> {
        if self.closed_flag.load(Ordering::SeqCst) {
            self.closed.get()
        } else {
            None
        }
    }

    /// The closed reason once `closed_flag` has been observed.
    fn closed_now(&self) -> ChannelClosed {
        match self.closed.get() {
            Some(reason) => reason.clone(),
            // The flag is stored after the reason is installed.
            None => unreachable!("closed flag set without a reason"),
        }
    }

    fn is_done_closed(&self) -> bool {
        matches!(self.closed_reason(), Some(ChannelClosed::Done))
    }

    /// Segment holding `seq`, or `None` if the head already advanced past it
    /// (the cell is guaranteed terminal; the claimant retries elsewhere).
    fn segment_for(&self, seq: u64) -> Option<Arc<Segment<T>>> {
        let id = seq / segment::SEGMENT_SIZE;
        let mut seg = self.head.load_full();
        if seg.id > id {
            return None;
        }
        while seg.id < id {
            seg = seg.next_or_alloc();
        }
        Some(seg)
    }

    /// CAS into a terminal state; the winner records the retirement.
    fn terminalize(&self, seg: &Segment<T>, seq: u64, from: u8, to: u8) -> bool {
        if seg.cell(seq).cas_state(from, to) {
            seg.retire_one(&self.head);
            true
        } else {
            false
        }
    }

    /// Blocks until `value` has been handed to a receiver or stored in the
    /// buffer. On failure the value is handed back inside the error.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            if let Some(reason) = self.closed_reason() {
                return Err(SendError::Closed(reason.clone(), value));
            }
            let s = self.senders.fetch_add(1, Ordering::SeqCst);
            let Some(seg) = self.segment_for(s) else {
                // Retired from under the claim: tombstoned, take a fresh index.
                continue;
            };
            match self.send_cell(&seg, s, value)? {
                None => return Ok(()),
                Some(v) => value = v,
            }
        }
    }

    /// Drives one claimed send cell. `Ok(None)` = delivered, `Ok(Some)` =
    /// retry at a fresh index.
    fn send_cell(&self, seg: &Arc<Segment<T>>, s: u64, value: T) -> Result<Option<T>, SendError<T>> {
        let cell = seg.cell(s);
        let mut value = value;
        loop {
            match cell.state() {
                EMPTY => {
                    let r = self.receivers.load(Ordering::SeqCst);
                    if s < r.saturating_add(self.capacity) {
                        match self.buffer_value(seg, s, value) {
                            Ok(()) => return Ok(None),
                            Err(BufferOutcome::Raced(v)) => value = v,
                            Err(BufferOutcome::Reclaimed(reason, v)) => {
                                return Err(SendError::Closed(reason, v));
                            }
                        }
                    } else {
                        match self.suspend_send(seg, s, value)? {
                            None => return Ok(None),
                            Some(v) => value = v,
                        }
                    }
                }
                RECV_WAITER => {
                    // The receiver's continuation; `RECV_WAITER` fixes its type.
                    let Some(k) = (unsafe { cell.take_waiter::<T>() }) else {
                        // The receiver is mid-teardown; its tombstone lands next.
                        std::hint::spin_loop();
                        continue;
                    };
                    match k.try_resume(value) {
                        Ok(()) => {
                            self.terminalize(seg, s, RECV_WAITER, DONE);
                            return Ok(None);
                        }
                        Err(v) => {
                            // Receiver interrupted; it may beat us to the tombstone.
                            self.terminalize(seg, s, RECV_WAITER, BROKEN);
                            return Ok(Some(v));
                        }
                    }
                }
                BROKEN | INTERRUPTED | CLOSED => return Ok(Some(value)),
                _ => unreachable!("second sender on cell {s}"),
            }
        }
    }

    /// CAS a value into an `Empty`, buffered-eligible cell, with the
    /// post-publish close re-check that keeps a concurrent close from
    /// stranding the value.
    fn buffer_value(&self, seg: &Segment<T>, s: u64, value: T) -> Result<(), BufferOutcome<T>> {
        let cell = seg.cell(s);
        unsafe { cell.write_value(value) };
        if !cell.cas_state(EMPTY, BUFFERED) {
            return Err(BufferOutcome::Raced(unsafe { cell.read_value() }));
        }
        if self.closed_flag.load(Ordering::SeqCst) {
            // Claimed before the close committed but published after its
            // sweep: reclaim so a finished drain stays final. Losing the CAS
            // means a receiver already drained the value — the send stands.
            if self.terminalize(seg, s, BUFFERED, CLOSED) {
                let value = unsafe { cell.read_value() };
                return Err(BufferOutcome::Reclaimed(self.closed_now(), value));
            }
        }
        Ok(())
    }

    /// Parks the sender in its cell. `Ok(None)` = a receiver took the value,
    /// `Ok(Some)` = the cell changed before publishing, re-drive it.
    fn suspend_send(
        &self,
        seg: &Arc<Segment<T>>,
        s: u64,
        value: T,
    ) -> Result<Option<T>, SendError<T>> {
        let cell = seg.cell(s);
        let k = Continuation::<()>::new();
        cell.install_waiter(Arc::clone(&k));
        unsafe { cell.write_value(value) };
        if !cell.cas_state(EMPTY, SEND_WAITER) {
            // Never published: reclaim both slots and re-drive the cell.
            let value = unsafe { cell.read_value() };
            drop(unsafe { cell.take_waiter::<()>() });
            return Ok(Some(value));
        }
        // Dekker with close(): the sweep snapshots the counters after the
        // flag store and our claim preceded our publish, so either the sweep
        // covers this cell or this load observes the flag.
        if self.closed_flag.load(Ordering::SeqCst) {
            if let Some(own) = unsafe { cell.take_waiter::<()>() } {
                drop(own);
                self.terminalize(seg, s, SEND_WAITER, CLOSED);
                let value = unsafe { cell.read_value() };
                return Err(SendError::Closed(self.closed_now(), value));
            }
            // The sweep owns our waiter and will resume us with the marker.
        }
        match k.park(|| {
            drop(unsafe { cell.take_waiter::<()>() });
            self.terminalize(seg, s, SEND_WAITER, INTERRUPTED);
        }) {
            Parked::Resumed(()) => Ok(None),
            Parked::Interrupted => {
                let value = unsafe { cell.read_value() };
                Err(SendError::Interrupted(value))
            }
            Parked::Closed => {
                // The sweep marked the cell; the value is ours to reclaim.
                let value = unsafe { cell.read_value() };
                Err(SendError::Closed(self.closed_now(), value))
            }
        }
    }

    /// Blocks until a value is available. A done-closed, drained channel
    /// yields `RecvError::Closed(Done)`.
    pub fn receive(&self) -> Result<T, RecvError> {
        match self.receive_or_closed()? {
            Some(v) => Ok(v),
            None => Err(RecvError::Closed(ChannelClosed::Done)),
        }
    }

    /// Like [`receive`](Self::receive), but surfaces an orderly close as
    /// `Ok(None)` instead of an error. After [`done`](Self::done), drains
    /// the buffer first.
    pub fn receive_or_closed(&self) -> Result<Option<T>, RecvError> {
        loop {
            if let Some(reason) = self.closed_reason() {
                if !reason.is_done() {
                    return Err(RecvError::Closed(reason.clone()));
                }
                // Done: drain, but never claim past the senders — those
                // cells can have no value anymore.
                if self.receivers.load(Ordering::SeqCst) >= self.senders.load(Ordering::SeqCst) {
                    return Ok(None);
                }
            }
            let r = self.receivers.fetch_add(1, Ordering::SeqCst);
            let Some(seg) = self.segment_for(r) else {
                continue;
            };
            match self.receive_cell(&seg, r)? {
                RecvStep::Got(v) => return Ok(Some(v)),
                RecvStep::DoneMarker => return Ok(None),
                RecvStep::Retry => {}
            }
        }
    }

    fn receive_cell(&self, seg: &Arc<Segment<T>>, r: u64) -> Result<RecvStep<T>, RecvError> {
        let cell = seg.cell(r);
        loop {
            match cell.state() {
                EMPTY => {
                    let s = self.senders.load(Ordering::SeqCst);
                    if r < s {
                        // A sender claimed this cell; give it a grace spin to
                        // materialize, then break the cell so both sides move on.
                        for _ in 0..MATERIALIZE_SPIN {
                            std::hint::spin_loop();
                            if cell.state() != EMPTY {
                                break;
                            }
                        }
                        if cell.state() == EMPTY && self.terminalize(seg, r, EMPTY, BROKEN) {
                            return Ok(RecvStep::Retry);
                        }
                        // Materialized (or someone else resolved it): re-drive.
                    } else if self.is_done_closed() {
                        // Done slipped in after the drain check; no sender
                        // will ever claim this cell.
                        return Ok(RecvStep::DoneMarker);
                    } else {
                        match self.suspend_receive(seg, r)? {
                            Some(step) => return Ok(step),
                            None => {}
                        }
                    }
                }
                BUFFERED => {
                    // Claim before reading: the consuming CAS is what grants
                    // the read (a close reclaim contends for the same cell).
                    if self.terminalize(seg, r, BUFFERED, DONE) {
                        return Ok(RecvStep::Got(unsafe { cell.read_value() }));
                    }
                }
                SEND_WAITER => {
                    let Some(k) = (unsafe { cell.take_waiter::<()>() }) else {
                        std::hint::spin_loop();
                        continue;
                    };
                    match k.try_resume(()) {
                        Ok(()) => {
                            let value = unsafe { cell.read_value() };
                            self.terminalize(seg, r, SEND_WAITER, DONE);
                            return Ok(RecvStep::Got(value));
                        }
                        Err(()) => {
                            // Sender interrupted before handing over.
                            self.terminalize(seg, r, SEND_WAITER, BROKEN);
                            return Ok(RecvStep::Retry);
                        }
                    }
                }
                BROKEN | INTERRUPTED | CLOSED => return Ok(RecvStep::Retry),
                _ => unreachable!("second receiver on cell {r}"),
            }
        }
    }

    /// Parks the receiver in its cell. `Ok(None)` = publish lost, re-drive.
    fn suspend_receive(
        &self,
        seg: &Arc<Segment<T>>,
        r: u64,
    ) -> Result<Option<RecvStep<T>>, RecvError> {
        let cell = seg.cell(r);
        let k = Continuation::<T>::new();
        cell.install_waiter(Arc::clone(&k));
        if !cell.cas_state(EMPTY, RECV_WAITER) {
            drop(unsafe { cell.take_waiter::<T>() });
            return Ok(None);
        }
        if self.closed_flag.load(Ordering::SeqCst) {
            if let Some(own) = unsafe { cell.take_waiter::<T>() } {
                drop(own);
                self.terminalize(seg, r, RECV_WAITER, CLOSED);
                return match self.closed_now() {
                    ChannelClosed::Done => Ok(Some(RecvStep::DoneMarker)),
                    reason => Err(RecvError::Closed(reason)),
                };
            }
        }
        match k.park(|| {
            drop(unsafe { cell.take_waiter::<T>() });
            self.terminalize(seg, r, RECV_WAITER, INTERRUPTED);
        }) {
            Parked::Resumed(v) => Ok(Some(RecvStep::Got(v))),
            Parked::Interrupted => Err(RecvError::Interrupted),
            Parked::Closed => match self.closed_now() {
                ChannelClosed::Done => Ok(Some(RecvStep::DoneMarker)),
                reason => Err(RecvError::Closed(reason)),
            },
        }
    }

    /// Delivers without blocking: succeeds iff a receiver is parked or the
    /// buffer has room right now.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut value = value;
        loop {
            if let Some(reason) = self.closed_reason() {
                return Err(TrySendError::Closed(reason.clone(), value));
            }
            let s = self.senders.fetch_add(1, Ordering::SeqCst);
            let Some(seg) = self.segment_for(s) else {
                continue;
            };
            let cell = seg.cell(s);
            'cell: loop {
                match cell.state() {
                    EMPTY => {
                        let r = self.receivers.load(Ordering::SeqCst);
                        if s < r.saturating_add(self.capacity) {
                            match self.buffer_value(&seg, s, value) {
                                Ok(()) => return Ok(()),
                                Err(BufferOutcome::Raced(v)) => value = v,
                                Err(BufferOutcome::Reclaimed(reason, v)) => {
                                    return Err(TrySendError::Closed(reason, v));
                                }
                            }
                        } else {
                            // Would have to park: abandon the claimed cell.
                            if self.terminalize(&seg, s, EMPTY, INTERRUPTED) {
                                return Err(TrySendError::Full(value));
                            }
                            // A receiver arrived in the meantime: re-drive.
                        }
                    }
                    RECV_WAITER => {
                        let Some(k) = (unsafe { cell.take_waiter::<T>() }) else {
                            std::hint::spin_loop();
                            continue 'cell;
                        };
                        match k.try_resume(value) {
                            Ok(()) => {
                                self.terminalize(&seg, s, RECV_WAITER, DONE);
                                return Ok(());
                            }
                            Err(v) => {
                                self.terminalize(&seg, s, RECV_WAITER, BROKEN);
                                value = v;
                                break 'cell;
                            }
                        }
                    }
                    BROKEN | INTERRUPTED | CLOSED => break 'cell,
                    _ => unreachable!("second sender on cell {s}"),
                }
            }
        }
    }

    /// Receives without blocking. `Ok(None)` = nothing available right now;
    /// `Err` = the channel is closed (and drained, for the done case).
    pub fn try_receive(&self) -> Result<Option<T>, ChannelClosed> {
        loop {
            let done = match self.closed_reason() {
                Some(reason) if !reason.is_done() => return Err(reason.clone()),
                Some(_) => true,
                None => false,
            };
            if self.receivers.load(Ordering::SeqCst) >= self.senders.load(Ordering::SeqCst) {
                return if done {
                    Err(ChannelClosed::Done)
                } else {
                    Ok(None)
                };
            }
            let r = self.receivers.fetch_add(1, Ordering::SeqCst);
            let Some(seg) = self.segment_for(r) else {
                continue;
            };
            let cell = seg.cell(r);
            'cell: loop {
                match cell.state() {
                    EMPTY => {
                        let s = self.senders.load(Ordering::SeqCst);
                        if r < s {
                            for _ in 0..MATERIALIZE_SPIN {
                                std::hint::spin_loop();
                                if cell.state() != EMPTY {
                                    break;
                                }
                            }
                            if cell.state() == EMPTY && self.terminalize(&seg, r, EMPTY, BROKEN) {
                                // A sender is mid-flight but its value is not
                                // ready; report empty rather than block.
                                return Ok(None);
                            }
                        } else if self.terminalize(&seg, r, EMPTY, BROKEN) {
                            return if done {
                                Err(ChannelClosed::Done)
                            } else {
                                Ok(None)
                            };
                        }
                    }
                    BUFFERED => {
                        if self.terminalize(&seg, r, BUFFERED, DONE) {
                            return Ok(Some(unsafe { cell.read_value() }));
                        }
                    }
                    SEND_WAITER => {
                        let Some(k) = (unsafe { cell.take_waiter::<()>() }) else {
                            std::hint::spin_loop();
                            continue 'cell;
                        };
                        match k.try_resume(()) {
                            Ok(()) => {
                                let value = unsafe { cell.read_value() };
                                self.terminalize(&seg, r, SEND_WAITER, DONE);
                                return Ok(Some(value));
                            }
                            Err(()) => {
                                self.terminalize(&seg, r, SEND_WAITER, BROKEN);
                                break 'cell;
                            }
                        }
                    }
                    BROKEN | INTERRUPTED | CLOSED => break 'cell,
                    _ => unreachable!("second receiver on cell {r}"),
                }
            }
        }
    }

    /// Closes the channel in an orderly way: no further sends, buffered
    /// values remain receivable. Returns false if already closed.
    pub fn done(&self) -> bool {
        self.close(ChannelClosed::Done)
    }

    /// Closes the channel with an error; buffered values are discarded.
    /// Returns false if already closed.
    pub fn error(&self, cause: impl StdError + Send + Sync + 'static) -> bool {
        self.close(ChannelClosed::Error(Arc::new(cause)))
    }

    fn close(&self, reason: ChannelClosed) -> bool {
        if self.closed.set(reason).is_err() {
            return false;
        }
        self.closed_flag.store(true, Ordering::SeqCst);
        // Sweep the parked range: waiters live between the two counters
        // (parked senders in [r, s), parked receivers in [s, r)). Claims
        // racing with this snapshot observe the flag after publishing and
        // self-cancel instead.
        let s = self.senders.load(Ordering::SeqCst);
        let r = self.receivers.load(Ordering::SeqCst);
        for seq in s.min(r)..s.max(r) {
            let Some(seg) = self.segment_for(seq) else {
                continue;
            };
            let cell = seg.cell(seq);
            match cell.state() {
                SEND_WAITER => {
                    if let Some(k) = unsafe { cell.take_waiter::<()>() } {
                        if k.resume_closed() {
                            // The woken sender reclaims its own value.
                            self.terminalize(&seg, seq, SEND_WAITER, CLOSED);
                        }
                    }
                }
                RECV_WAITER => {
                    if let Some(k) = unsafe { cell.take_waiter::<T>() } {
                        if k.resume_closed() {
                            self.terminalize(&seg, seq, RECV_WAITER, CLOSED);
                        }
                    }
                }
                _ => {}
            }
        }
        true
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        // Parked waiters borrow the channel for the whole call, so none can
        // be left; only buffered values and unclaimed waiter references
        // remain. `&mut self` rules out any concurrent access.
        let mut seg = Some(self.head.load_full());
        while let Some(s) = seg {
            unsafe { s.drop_contents() };
            seg = s.next_existing();
        }
    }
}

enum RecvStep<T> {
    Got(T),
    DoneMarker,
    Retry,
}

enum BufferOutcome<T> {
    /// The cell changed before the publishing CAS; value handed back.
    Raced(T),
    /// Closed concurrently; the value was reclaimed.
    Reclaimed(ChannelClosed, T),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt;
    use std::collections::BTreeSet;
    use std::thread;
    use std::time::Duration;

    /// Simple cross-thread handoff on a rendezvous channel.
    #[test]
    fn test_rendezvous_handoff() {
        let ch = Channel::<i32>::rendezvous();
        thread::scope(|s| {
            s.spawn(|| ch.send(5).unwrap());
            assert_eq!(ch.receive().unwrap(), 5);
        });
    }

    /// A buffered channel absorbs sends up to capacity without a receiver.
    #[test]
    fn test_buffered_sends_do_not_block() {
        let ch = Channel::<i32>::buffered(2);
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        assert_eq!(ch.receive().unwrap(), 1);
        assert_eq!(ch.receive().unwrap(), 2);
    }

    /// try_send on a rendezvous channel with no receiver reports Full and
    /// hands the value back.
    #[test]
    fn test_try_send_full() {
        let ch = Channel::<String>::rendezvous();
        match ch.try_send("x".into()) {
            Err(TrySendError::Full(v)) => assert_eq!(v, "x"),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    /// try_receive drains the buffer and reports empty afterwards.
    #[test]
    fn test_try_receive() {
        let ch = Channel::<i32>::buffered(4);
        assert!(ch.try_receive().unwrap().is_none());
        ch.try_send(7).unwrap();
        assert_eq!(ch.try_receive().unwrap(), Some(7));
        assert!(ch.try_receive().unwrap().is_none());
    }

    /// Per-sender FIFO: one producer's values arrive in program order.
    #[test]
    fn test_fifo_per_sender() {
        let ch = Channel::<u32>::buffered(8);
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..1000 {
                    ch.send(i).unwrap();
                }
            });
            for i in 0..1000 {
                assert_eq!(ch.receive().unwrap(), i);
            }
        });
    }

    /// done() lets the buffer drain, then yields the done marker forever.
    #[test]
    fn test_done_drains_then_marker() {
        let ch = Channel::<i32>::buffered(4);
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        assert!(ch.done());
        assert!(!ch.done());
        assert!(matches!(ch.send(3), Err(SendError::Closed(ChannelClosed::Done, 3))));
        assert_eq!(ch.receive_or_closed().unwrap(), Some(1));
        assert_eq!(ch.receive_or_closed().unwrap(), Some(2));
        assert_eq!(ch.receive_or_closed().unwrap(), None);
        assert_eq!(ch.receive_or_closed().unwrap(), None);
        assert!(matches!(
            ch.receive(),
            Err(RecvError::Closed(ChannelClosed::Done))
        ));
    }

    /// error() discards buffered values and surfaces the cause everywhere.
    #[test]
    fn test_error_discards() {
        let ch = Channel::<i32>::buffered(4);
        ch.send(1).unwrap();
        ch.error(std::io::Error::other("boom"));
        assert!(matches!(
            ch.receive_or_closed(),
            Err(RecvError::Closed(ChannelClosed::Error(_)))
        ));
        assert!(matches!(ch.try_receive(), Err(ChannelClosed::Error(_))));
    }

    /// Closing wakes a parked receiver with the done marker.
    #[test]
    fn test_done_wakes_parked_receiver() {
        let ch = Channel::<i32>::rendezvous();
        thread::scope(|s| {
            let waiter = s.spawn(|| ch.receive_or_closed());
            thread::sleep(Duration::from_millis(20));
            ch.done();
            assert_eq!(waiter.join().unwrap().unwrap(), None);
        });
    }

    /// Closing wakes a parked sender, which gets its value back.
    #[test]
    fn test_done_wakes_parked_sender() {
        let ch = Channel::<i32>::rendezvous();
        thread::scope(|s| {
            let waiter = s.spawn(|| ch.send(9));
            thread::sleep(Duration::from_millis(20));
            ch.done();
            match waiter.join().unwrap() {
                Err(SendError::Closed(ChannelClosed::Done, 9)) => {}
                other => panic!("expected closed send, got {other:?}"),
            }
        });
    }

    /// An interrupted parked receiver tombstones its cell; the sender
    /// retries at a fresh index and still reaches a live receiver.
    #[test]
    fn test_interrupted_receiver_does_not_lose_value() {
        let ch = Channel::<i32>::rendezvous();
        thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel();
            let victim = s.spawn(|| {
                let (handle, _guard) = interrupt::register_current();
                tx.send(handle).unwrap();
                ch.receive()
            });
            let handle = rx.recv().unwrap();
            thread::sleep(Duration::from_millis(20));
            handle.set();
            assert!(matches!(victim.join().unwrap(), Err(RecvError::Interrupted)));

            let sender = s.spawn(|| ch.send(42));
            assert_eq!(ch.receive().unwrap(), 42);
            sender.join().unwrap().unwrap();
        });
    }

    /// An interrupted parked sender gets its value back.
    #[test]
    fn test_interrupted_sender_reclaims_value() {
        let ch = Channel::<String>::rendezvous();
        thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel();
            let victim = s.spawn(|| {
                let (handle, _guard) = interrupt::register_current();
                tx.send(handle).unwrap();
                ch.send("held".to_string())
            });
            let handle = rx.recv().unwrap();
            thread::sleep(Duration::from_millis(20));
            handle.set();
            match victim.join().unwrap() {
                Err(SendError::Interrupted(v)) => assert_eq!(v, "held"),
                other => panic!("expected interrupted send, got {other:?}"),
            }
        });
    }

    /// Many producers, many consumers: every value is received exactly once.
    #[test]
    fn test_producers_consumers_multiset() {
        const PRODUCERS: u32 = 8;
        const PER_PRODUCER: u32 = 250;
        let ch = Channel::<u32>::rendezvous();
        let received = std::sync::Mutex::new(Vec::new());
        thread::scope(|s| {
            for p in 0..PRODUCERS {
                let ch = &ch;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        ch.send(p * PER_PRODUCER + i).unwrap();
                    }
                });
            }
            for _ in 0..PRODUCERS {
                let ch = &ch;
                let received = &received;
                s.spawn(move || {
                    let mut local = Vec::new();
                    for _ in 0..PER_PRODUCER {
                        local.push(ch.receive().unwrap());
                    }
                    received.lock().unwrap().extend(local);
                });
            }
        });
        let received: BTreeSet<u32> = received.into_inner().unwrap().into_iter().collect();
        assert_eq!(received.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert_eq!(received.iter().next_back(), Some(&(PRODUCERS * PER_PRODUCER - 1)));
    }

    /// Buffered values are dropped with the channel (no leak).
    #[test]
    fn test_drop_unread_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ch = Channel::<DropCounter>::buffered(4);
            ch.send(DropCounter(Arc::clone(&drops))).unwrap();
            ch.send(DropCounter(Arc::clone(&drops))).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    /// Traffic crossing many segment boundaries retires old segments and
    /// still delivers everything (exercises head advancement).
    #[test]
    fn test_segment_turnover() {
        let ch = Channel::<u64>::buffered(1);
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..10_000u64 {
                    ch.send(i).unwrap();
                }
            });
            for i in 0..10_000u64 {
                assert_eq!(ch.receive().unwrap(), i);
            }
        });
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Multiset of received values equals the multiset sent, for any
            /// split of values across two producers and any buffer capacity.
            #[test]
            fn prop_multiset_preserved(
                a in proptest::collection::vec(any::<u16>(), 0..64),
                b in proptest::collection::vec(any::<u16>(), 0..64),
                capacity in 0usize..8,
            ) {
                let ch = Channel::<u16>::buffered(capacity);
                let total = a.len() + b.len();
                let mut got = Vec::with_capacity(total);
                thread::scope(|s| {
                    let ch_ref = &ch;
                    let a2 = a.clone();
                    let b2 = b.clone();
                    s.spawn(move || {
                        for v in a2 {
                            ch_ref.send(v).unwrap();
                        }
                    });
                    s.spawn(move || {
                        for v in b2 {
                            ch_ref.send(v).unwrap();
                        }
                    });
                    for _ in 0..total {
                        got.push(ch.receive().unwrap());
                    }
                });
                let mut expected: Vec<u16> = a.iter().chain(b.iter()).copied().collect();
                expected.sort_unstable();
                got.sort_unstable();
                prop_assert_eq!(got, expected);
            }
        }
    }
}
