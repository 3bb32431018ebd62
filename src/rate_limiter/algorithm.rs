//! Rate limiter algorithms.
//!
//! Every algorithm keeps its state behind a single mutex, so `acquire`,
//! `try_acquire` and `update` are trivially linearizable. Blocked acquirers
//! park on a waiter list (not a condvar) so a scope tearing its carrier down
//! can wake them through the interrupt flag.

use std::collections::VecDeque;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::interrupt::{self, Interrupted};
use crate::retry::adaptive::TokenBucket;

/// Admission by request count. A background fork calls
/// [`update`](RateLimiterAlgorithm::update) every
/// [`next_update`](RateLimiterAlgorithm::next_update).
pub trait RateLimiterAlgorithm: Send + Sync + 'static {
    /// Admits without blocking, or reports that the caller must wait.
    fn try_acquire(&self) -> bool;

    /// Blocks (parked) until admitted or interrupted.
    fn acquire(&self) -> Result<(), Interrupted>;

    /// Periodic replenish: reset the window, leak, or add a token.
    fn update(&self);

    /// Time until the next `update` is due.
    fn next_update(&self) -> Duration;
}

/// Admission by request count *and* in-flight accounting:
/// [`start_operation`](Self::start_operation) begins occupancy without an
/// admission check (forced entry), [`end_operation`](Self::end_operation)
/// completes it. Capacity returns per the algorithm's window/leak logic,
/// not at `end_operation` itself.
pub trait DurationRateLimiterAlgorithm: RateLimiterAlgorithm {
    fn start_operation(&self);
    fn end_operation(&self);
}

/// Parked threads waiting for capacity. `wake_all` after any state change
/// that may admit someone; woken threads re-run the admission check.
struct Waiters {
    parked: Mutex<Vec<Thread>>,
}

impl Waiters {
    fn new() -> Self {
        Self {
            parked: Mutex::new(Vec::new()),
        }
    }

    fn wake_all(&self) {
        for t in self.parked.lock().drain(..) {
            t.unpark();
        }
    }

    /// Parks until `admit` returns true or the carrier is interrupted.
    fn block_on(&self, mut admit: impl FnMut() -> bool) -> Result<(), Interrupted> {
        let intr = interrupt::current();
        loop {
            self.parked.lock().push(thread::current());
            if admit() {
                return Ok(());
            }
            if intr.is_set() {
                return Err(Interrupted);
            }
            thread::park();
        }
    }
}

/// At most `max` admissions per window; the counter resets when the window
/// rolls over.
pub struct FixedWindow {
    max: u64,
    window: Duration,
    state: Mutex<FixedWindowState>,
    waiters: Waiters,
}

struct FixedWindowState {
    used: u64,
    window_started: Instant,
}

impl FixedWindow {
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(FixedWindowState {
                used: 0,
                window_started: Instant::now(),
            }),
            waiters: Waiters::new(),
        }
    }
}

impl RateLimiterAlgorithm for FixedWindow {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.used < self.max {
            state.used += 1;
            true
        } else {
            false
        }
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        self.waiters.block_on(|| self.try_acquire())
    }

    fn update(&self) {
        let mut state = self.state.lock();
        state.used = 0;
        state.window_started = Instant::now();
        drop(state);
        self.waiters.wake_all();
    }

    fn next_update(&self) -> Duration {
        let state = self.state.lock();
        (state.window_started + self.window).saturating_duration_since(Instant::now())
    }
}

/// At most `max` admissions in any interval of length `window`: a log of
/// admission timestamps, pruned as it slides.
pub struct SlidingWindow {
    max: u64,
    window: Duration,
    log: Mutex<VecDeque<Instant>>,
    waiters: Waiters,
}

impl SlidingWindow {
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            log: Mutex::new(VecDeque::new()),
            waiters: Waiters::new(),
        }
    }

    fn prune(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            log.pop_front();
        }
    }
}

impl RateLimiterAlgorithm for SlidingWindow {
    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut log = self.log.lock();
        self.prune(&mut log, now);
        if (log.len() as u64) < self.max {
            log.push_back(now);
            true
        } else {
            false
        }
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        self.waiters.block_on(|| self.try_acquire())
    }

    fn update(&self) {
        let now = Instant::now();
        self.prune(&mut self.log.lock(), now);
        self.waiters.wake_all();
    }

    fn next_update(&self) -> Duration {
        let log = self.log.lock();
        match log.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(Instant::now()),
            None => self.window,
        }
    }
}

/// Token bucket: `update` adds one token up to `max`, each admission
/// consumes one.
pub struct Bucket {
    tokens: TokenBucket,
    refill_interval: Duration,
    waiters: Waiters,
}

impl Bucket {
    pub fn new(max: u64, refill_interval: Duration) -> Self {
        Self {
            tokens: TokenBucket::new(max),
            refill_interval,
            waiters: Waiters::new(),
        }
    }
}

impl RateLimiterAlgorithm for Bucket {
    fn try_acquire(&self) -> bool {
        self.tokens.try_acquire(1)
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        self.waiters.block_on(|| self.try_acquire())
    }

    fn update(&self) {
        self.tokens.release(1);
        self.waiters.wake_all();
    }

    fn next_update(&self) -> Duration {
        self.refill_interval
    }
}

/// Fixed window with in-flight accounting: an operation occupies a slot
/// from its start until the first window reset after it ended.
pub struct FixedWindowDuration {
    max: u64,
    window: Duration,
    state: Mutex<FixedWindowDurationState>,
    waiters: Waiters,
}

struct FixedWindowDurationState {
    running: u64,
    /// Operations that ended but whose slot frees only at the next reset.
    ended_this_window: u64,
    window_started: Instant,
}

impl FixedWindowDuration {
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(FixedWindowDurationState {
                running: 0,
                ended_this_window: 0,
                window_started: Instant::now(),
            }),
            waiters: Waiters::new(),
        }
    }
}

impl RateLimiterAlgorithm for FixedWindowDuration {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.running + state.ended_this_window < self.max {
            state.running += 1;
            true
        } else {
            false
        }
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        self.waiters.block_on(|| self.try_acquire())
    }

    fn update(&self) {
        let mut state = self.state.lock();
        state.ended_this_window = 0;
        state.window_started = Instant::now();
        drop(state);
        self.waiters.wake_all();
    }

    fn next_update(&self) -> Duration {
        let state = self.state.lock();
        (state.window_started + self.window).saturating_duration_since(Instant::now())
    }
}

impl DurationRateLimiterAlgorithm for FixedWindowDuration {
    fn start_operation(&self) {
        self.state.lock().running += 1;
    }

    fn end_operation(&self) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        state.ended_this_window += 1;
    }
}

/// Sliding window with in-flight accounting: an operation occupies a slot
/// from its start until `window` after it ended.
pub struct SlidingWindowDuration {
    max: u64,
    window: Duration,
    state: Mutex<SlidingWindowDurationState>,
    waiters: Waiters,
}

struct SlidingWindowDurationState {
    running: u64,
    ends: VecDeque<Instant>,
}

impl SlidingWindowDuration {
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(SlidingWindowDurationState {
                running: 0,
                ends: VecDeque::new(),
            }),
            waiters: Waiters::new(),
        }
    }

    fn prune(&self, state: &mut SlidingWindowDurationState, now: Instant) {
        while state
            .ends
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            state.ends.pop_front();
        }
    }
}

impl RateLimiterAlgorithm for SlidingWindowDuration {
    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.prune(&mut state, now);
        if state.running + (state.ends.len() as u64) < self.max {
            state.running += 1;
            true
        } else {
            false
        }
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        self.waiters.block_on(|| self.try_acquire())
    }

    fn update(&self) {
        let now = Instant::now();
        self.prune(&mut self.state.lock(), now);
        self.waiters.wake_all();
    }

    fn next_update(&self) -> Duration {
        let state = self.state.lock();
        match state.ends.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(Instant::now()),
            None => self.window,
        }
    }
}

impl DurationRateLimiterAlgorithm for SlidingWindowDuration {
    fn start_operation(&self) {
        self.state.lock().running += 1;
    }

    fn end_operation(&self) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        state.ends.push_back(Instant::now());
    }
}

/// Leaky bucket with in-flight accounting: starting an operation fills the
/// bucket, `update` leaks one completed operation per interval.
pub struct LeakyBucket {
    max: u64,
    leak_interval: Duration,
    state: Mutex<LeakyBucketState>,
    waiters: Waiters,
}

struct LeakyBucketState {
    level: u64,
    completed: u64,
}

impl LeakyBucket {
    pub fn new(max: u64, leak_interval: Duration) -> Self {
        Self {
            max,
            leak_interval,
            state: Mutex::new(LeakyBucketState {
                level: 0,
                completed: 0,
            }),
            waiters: Waiters::new(),
        }
    }
}

impl RateLimiterAlgorithm for LeakyBucket {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.level < self.max {
            state.level += 1;
            true
        } else {
            false
        }
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        self.waiters.block_on(|| self.try_acquire())
    }

    fn update(&self) {
        let mut state = self.state.lock();
        if state.completed > 0 && state.level > 0 {
            state.completed -= 1;
            state.level -= 1;
            drop(state);
            self.waiters.wake_all();
        }
    }

    fn next_update(&self) -> Duration {
        self.leak_interval
    }
}

impl DurationRateLimiterAlgorithm for LeakyBucket {
    fn start_operation(&self) {
        self.state.lock().level += 1;
    }

    fn end_operation(&self) {
        self.state.lock().completed += 1;
    }
}
