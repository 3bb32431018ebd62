//! Rate limiters: admission control in front of arbitrary operations.
//!
//! A limiter pairs an algorithm with one daemon fork in the owning scope
//! that sleeps until the next replenish is due, applies it, and loops until
//! the scope ends. `acquire` parks the caller until admitted (or its
//! carrier is interrupted); `try_acquire` never blocks.
//!
//! ```
//! use std::time::Duration;
//! use corral::{supervised, RateLimiter};
//!
//! supervised(|scope| {
//!     let limiter = RateLimiter::fixed_rate(&scope, 2, Duration::from_millis(100));
//!     assert!(limiter.try_acquire());
//!     assert!(limiter.try_acquire());
//!     assert!(!limiter.try_acquire());
//! });
//! ```

pub mod algorithm;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::interrupt::{self, Interrupted};
use crate::scope::Scope;

use algorithm::{
    Bucket, DurationRateLimiterAlgorithm, FixedWindow, FixedWindowDuration, LeakyBucket,
    RateLimiterAlgorithm, SlidingWindow, SlidingWindowDuration,
};

/// Runs the replenish loop on the limiter's daemon fork; ends with the
/// scope.
fn replenish_loop(algorithm: Arc<dyn RateLimiterAlgorithm>) {
    loop {
        let due_in = algorithm.next_update();
        if interrupt::sleep(due_in).is_err() {
            trace!(target: "corral::rate_limiter", "replenish fork interrupted; stopping");
            return;
        }
        algorithm.update();
    }
}

/// Request-count rate limiter. Bound to the scope whose daemon fork drives
/// its updates.
pub struct RateLimiter<'scope> {
    algorithm: Arc<dyn RateLimiterAlgorithm>,
    _scope: PhantomData<&'scope ()>,
}

impl<'scope> RateLimiter<'scope> {
    /// At most `max` admissions per fixed window.
    pub fn fixed_rate<'env>(
        scope: &Scope<'scope, 'env>,
        max: u64,
        window: Duration,
    ) -> RateLimiter<'scope> {
        Self::start(scope, Arc::new(FixedWindow::new(max, window)))
    }

    /// At most `max` admissions in any interval of length `window`.
    pub fn sliding_window<'env>(
        scope: &Scope<'scope, 'env>,
        max: u64,
        window: Duration,
    ) -> RateLimiter<'scope> {
        Self::start(scope, Arc::new(SlidingWindow::new(max, window)))
    }

    /// Token bucket of `max` tokens, one added per `refill_interval`.
    pub fn bucket<'env>(
        scope: &Scope<'scope, 'env>,
        max: u64,
        refill_interval: Duration,
    ) -> RateLimiter<'scope> {
        Self::start(scope, Arc::new(Bucket::new(max, refill_interval)))
    }

    /// Wraps a caller-provided algorithm.
    pub fn custom<'env>(
        scope: &Scope<'scope, 'env>,
        algorithm: Arc<dyn RateLimiterAlgorithm>,
    ) -> RateLimiter<'scope> {
        Self::start(scope, algorithm)
    }

    fn start<'env>(
        scope: &Scope<'scope, 'env>,
        algorithm: Arc<dyn RateLimiterAlgorithm>,
    ) -> RateLimiter<'scope> {
        let background = Arc::clone(&algorithm);
        scope.fork(move || replenish_loop(background));
        RateLimiter {
            algorithm,
            _scope: PhantomData,
        }
    }

    /// Blocks until admitted.
    pub fn acquire(&self) -> Result<(), Interrupted> {
        self.algorithm.acquire()
    }

    /// Admits without blocking.
    pub fn try_acquire(&self) -> bool {
        self.algorithm.try_acquire()
    }

    /// Admits, then runs `op`.
    pub fn run<T>(&self, op: impl FnOnce() -> T) -> Result<T, Interrupted> {
        self.acquire()?;
        Ok(op())
    }
}

/// Ends the operation even if `op` unwinds.
struct OperationGuard<'a> {
    algorithm: &'a dyn DurationRateLimiterAlgorithm,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.algorithm.end_operation();
    }
}

/// Rate limiter with in-flight accounting: admission reserves a slot that
/// is given back per the algorithm's window/leak logic after
/// [`end_operation`](Self::end_operation).
pub struct DurationRateLimiter<'scope> {
    algorithm: Arc<dyn DurationRateLimiterAlgorithm>,
    _scope: PhantomData<&'scope ()>,
}

impl<'scope> DurationRateLimiter<'scope> {
    /// An operation occupies a slot from start until the first window reset
    /// after it ended.
    pub fn fixed_window<'env>(
        scope: &Scope<'scope, 'env>,
        max: u64,
        window: Duration,
    ) -> DurationRateLimiter<'scope> {
        Self::start(scope, Arc::new(FixedWindowDuration::new(max, window)))
    }

    /// An operation occupies a slot from start until `window` after it
    /// ended.
    pub fn sliding_window<'env>(
        scope: &Scope<'scope, 'env>,
        max: u64,
        window: Duration,
    ) -> DurationRateLimiter<'scope> {
        Self::start(scope, Arc::new(SlidingWindowDuration::new(max, window)))
    }

    /// Starting an operation fills the bucket; one completed operation
    /// leaks per interval.
    pub fn leaky_bucket<'env>(
        scope: &Scope<'scope, 'env>,
        max: u64,
        leak_interval: Duration,
    ) -> DurationRateLimiter<'scope> {
        Self::start(scope, Arc::new(LeakyBucket::new(max, leak_interval)))
    }

    fn start<'env>(
        scope: &Scope<'scope, 'env>,
        algorithm: Arc<dyn DurationRateLimiterAlgorithm>,
    ) -> DurationRateLimiter<'scope> {
        let background: Arc<dyn RateLimiterAlgorithm> = Arc::clone(&algorithm) as _;
        scope.fork(move || replenish_loop(background));
        DurationRateLimiter {
            algorithm,
            _scope: PhantomData,
        }
    }

    pub fn acquire(&self) -> Result<(), Interrupted> {
        self.algorithm.acquire()
    }

    pub fn try_acquire(&self) -> bool {
        self.algorithm.try_acquire()
    }

    /// Begins occupancy without an admission check.
    pub fn start_operation(&self) {
        self.algorithm.start_operation();
    }

    pub fn end_operation(&self) {
        self.algorithm.end_operation();
    }

    /// Admits, runs `op`, and ends the operation even on unwind.
    pub fn run<T>(&self, op: impl FnOnce() -> T) -> Result<T, Interrupted> {
        self.acquire()?;
        let _guard = OperationGuard {
            algorithm: &*self.algorithm,
        };
        Ok(op())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::sleep;
    use crate::supervised;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    /// Admissions in one fixed window never exceed the max; the next window
    /// admits again.
    #[test]
    fn test_fixed_rate_resets() {
        supervised(|scope| {
            let limiter = RateLimiter::fixed_rate(&scope, 2, Duration::from_millis(60));
            assert!(limiter.try_acquire());
            assert!(limiter.try_acquire());
            assert!(!limiter.try_acquire());
            sleep(Duration::from_millis(90)).unwrap();
            assert!(limiter.try_acquire());
        });
    }

    /// A blocked acquire is admitted once the window rolls over.
    #[test]
    fn test_acquire_blocks_until_replenish() {
        supervised(|scope| {
            let limiter = RateLimiter::fixed_rate(&scope, 1, Duration::from_millis(50));
            assert!(limiter.try_acquire());
            let started = Instant::now();
            limiter.acquire().unwrap();
            assert!(started.elapsed() >= Duration::from_millis(20));
        });
    }

    /// Sliding window: no interval of length `window` sees more than `max`
    /// admissions.
    #[test]
    fn test_sliding_window_bound() {
        supervised(|scope| {
            let limiter = RateLimiter::sliding_window(&scope, 3, Duration::from_millis(80));
            let mut admitted = Vec::new();
            for _ in 0..6 {
                limiter.acquire().unwrap();
                admitted.push(Instant::now());
            }
            for window_start in &admitted {
                let in_window = admitted
                    .iter()
                    .filter(|t| {
                        **t >= *window_start
                            && t.duration_since(*window_start) < Duration::from_millis(80)
                    })
                    .count();
                assert!(in_window <= 3, "{in_window} admissions in one window");
            }
        });
    }

    /// Token bucket: drained tokens come back one refill at a time.
    #[test]
    fn test_bucket_refill() {
        supervised(|scope| {
            let limiter = RateLimiter::bucket(&scope, 2, Duration::from_millis(40));
            assert!(limiter.try_acquire());
            assert!(limiter.try_acquire());
            assert!(!limiter.try_acquire());
            limiter.acquire().unwrap();
        });
    }

    /// run() admits before executing.
    #[test]
    fn test_run_counts() {
        let ran = AtomicU64::new(0);
        supervised(|scope| {
            let limiter = RateLimiter::fixed_rate(&scope, 10, Duration::from_secs(60));
            for _ in 0..5 {
                limiter.run(|| ran.fetch_add(1, Ordering::SeqCst)).unwrap();
            }
        });
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    /// Duration limiter: a slot is reserved while the operation runs and
    /// comes back only after end + replenish.
    #[test]
    fn test_duration_in_flight_accounting() {
        supervised(|scope| {
            let limiter = DurationRateLimiter::fixed_window(&scope, 1, Duration::from_millis(50));
            assert!(limiter.try_acquire());
            // In flight: no capacity even though no window rolled.
            assert!(!limiter.try_acquire());
            limiter.end_operation();
            // Ended, but the slot frees only at the next reset.
            assert!(!limiter.try_acquire());
            sleep(Duration::from_millis(80)).unwrap();
            assert!(limiter.try_acquire());
        });
    }

    /// Duration run() releases the slot even when the operation panics.
    #[test]
    fn test_duration_run_unwind_safe() {
        supervised(|scope| {
            let limiter = DurationRateLimiter::sliding_window(&scope, 1, Duration::from_millis(30));
            let result: Result<(), _> = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                || limiter.run(|| panic!("op failed")).unwrap(),
            ));
            assert!(result.is_err());
            // The slot frees once the window slides past the (recorded) end.
            sleep(Duration::from_millis(60)).unwrap();
            assert!(limiter.try_acquire());
        });
    }

    /// Leaky bucket: completions leak out one per interval.
    #[test]
    fn test_leaky_bucket() {
        supervised(|scope| {
            let limiter = DurationRateLimiter::leaky_bucket(&scope, 2, Duration::from_millis(30));
            assert!(limiter.try_acquire());
            assert!(limiter.try_acquire());
            assert!(!limiter.try_acquire());
            limiter.end_operation();
            // Leak happens on the next tick, not at end_operation.
            limiter.acquire().unwrap();
        });
    }
}
