//! Segmented backing store for the logically unbounded cell array.
//!
//! Cells live in fixed-size segments linked through `next`. Navigation
//! starts from the channel's head pointer (an [`ArcSwap`]), so every
//! traversal holds a strong reference to the segment it inspects and freed
//! memory is never touched.
//!
//! Retirement: every transition into a terminal cell state bumps the
//! segment's `terminal` counter; when it reaches [`SEGMENT_SIZE`] the head
//! is CAS-advanced past the segment. The segment's memory is released once
//! the last in-flight reference drops — a parked waiter keeps an `Arc` to
//! its own segment across the park, so its cell stays valid for the
//! post-wake reclaim. An operation whose claimed index now sits behind the
//! head treats the cell as tombstoned and retries at a fresh index.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;

use super::cell::Cell;

/// Cells per segment. Power of two so the in-segment index is a mask.
pub(super) const SEGMENT_SIZE: u64 = 32;
const INDEX_MASK: u64 = SEGMENT_SIZE - 1;

pub(super) struct Segment<T> {
    /// Segment index; covers cells `[id * SEGMENT_SIZE, (id + 1) * SEGMENT_SIZE)`.
    pub(super) id: u64,
    cells: [Cell<T>; SEGMENT_SIZE as usize],
    next: OnceLock<Arc<Segment<T>>>,
    /// Cells of this segment that reached a terminal state.
    terminal: AtomicU32,
}

impl<T> Segment<T> {
    pub(super) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            cells: std::array::from_fn(|_| Cell::new()),
            next: OnceLock::new(),
            terminal: AtomicU32::new(0),
        })
    }

    /// The cell for a global sequence number that falls in this segment.
    #[inline]
    pub(super) fn cell(&self, seq: u64) -> &Cell<T> {
        debug_assert_eq!(seq / SEGMENT_SIZE, self.id);
        &self.cells[(seq & INDEX_MASK) as usize]
    }

    pub(super) fn next_or_alloc(&self) -> Arc<Segment<T>> {
        Arc::clone(self.next.get_or_init(|| Segment::new(self.id + 1)))
    }

    pub(super) fn next_existing(&self) -> Option<Arc<Segment<T>>> {
        self.next.get().cloned()
    }

    /// Records one terminal transition; advances the head when the segment
    /// is fully terminal. Called exactly once per cell, by the thread that
    /// won the terminal CAS.
    pub(super) fn retire_one(&self, head: &ArcSwap<Segment<T>>) {
        let terminal = self.terminal.fetch_add(1, Ordering::AcqRel) + 1;
        if u64::from(terminal) == SEGMENT_SIZE {
            Self::advance_head(head);
        }
    }

    /// Moves `head` past the fully-terminal prefix. Head only ever moves
    /// forward; a lost CAS means another thread advanced it for us.
    fn advance_head(head: &ArcSwap<Segment<T>>) {
        loop {
            let cur = head.load_full();
            if u64::from(cur.terminal.load(Ordering::Acquire)) < SEGMENT_SIZE {
                return;
            }
            let Some(next) = cur.next_existing() else {
                return;
            };
            head.compare_and_swap(&cur, next);
        }
    }

    /// # Safety
    /// Only from the channel's `Drop`: no concurrent access of any kind.
    pub(super) unsafe fn drop_contents(&self) {
        for cell in &self.cells {
            unsafe { cell.drop_contents() };
        }
    }
}
