//! Adaptive retries: a shared token bucket throttles how much retrying a
//! group of operations may do, so a systemic outage cannot multiply load.
//!
//! Each retried failure costs [`failure_cost`](AdaptiveRetry::failure_cost)
//! tokens; each success pays [`success_reward`](AdaptiveRetry::success_reward)
//! back. When the bucket runs dry, failures stop being retried until
//! successes refill it.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error_mode::{ErrorMode, ResultMode};
use crate::scheduled::scheduled_with_error_mode;

use super::RetryConfig;

/// Thread-safe token counter with a fixed capacity.
pub struct TokenBucket {
    tokens: AtomicU64,
    capacity: u64,
}

impl TokenBucket {
    /// A full bucket of `capacity` tokens.
    pub fn new(capacity: u64) -> Self {
        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Takes `n` tokens iff all of them are available.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < n {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns `n` tokens, saturating at capacity.
    pub fn release(&self, n: u64) {
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(self.capacity);
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Token-bucket gate over a [`RetryConfig`]'s policy. Share one instance
/// (the bucket is behind an `Arc`) across every call site that talks to the
/// same downstream.
#[derive(Clone)]
pub struct AdaptiveRetry {
    pub token_bucket: Arc<TokenBucket>,
    /// Tokens taken per retried failure.
    pub failure_cost: u64,
    /// Tokens returned per success.
    pub success_reward: u64,
}

impl Default for AdaptiveRetry {
    /// Bucket of 500 tokens, failures cost 5, successes pay back 1.
    fn default() -> Self {
        Self {
            token_bucket: Arc::new(TokenBucket::new(500)),
            failure_cost: 5,
            success_reward: 1,
        }
    }
}

impl AdaptiveRetry {
    pub fn new(bucket_capacity: u64, failure_cost: u64, success_reward: u64) -> Self {
        Self {
            token_bucket: Arc::new(TokenBucket::new(bucket_capacity)),
            failure_cost,
            success_reward,
        }
    }

    /// Retries a `Result`-returning operation; values the policy considers
    /// non-successes pay the failure cost before retrying.
    pub fn retry<T, E, Op>(&self, config: &RetryConfig<E, T>, op: Op) -> Result<T, E>
    where
        Op: FnMut() -> Result<T, E>,
    {
        self.retry_with_error_mode(ResultMode, config, |_| true, op)
    }

    /// Retries under an arbitrary error mode. `pays_penalty` decides, for a
    /// value the policy rejects, whether retrying it must consume tokens.
    pub fn retry_with_error_mode<M, E, T, Op>(
        &self,
        mode: M,
        config: &RetryConfig<E, T>,
        pays_penalty: impl Fn(&T) -> bool,
        op: Op,
    ) -> M::Container<T>
    where
        M: ErrorMode<E>,
        Op: FnMut() -> M::Container<T>,
    {
        let policy = &config.result_policy;
        let on_retry = config.on_retry.as_deref();
        let bucket = &self.token_bucket;
        scheduled_with_error_mode(
            mode,
            &config.scheduled(),
            |attempt, outcome| match mode.peek(outcome) {
                Err(e) if policy.is_worth_retrying(e) => {
                    // Retry only while tokens remain.
                    if bucket.try_acquire(self.failure_cost) {
                        if let Some(hook) = on_retry {
                            hook(attempt, Err(e));
                        }
                        ControlFlow::Continue(())
                    } else {
                        ControlFlow::Break(())
                    }
                }
                Err(_) => ControlFlow::Break(()),
                Ok(v) if policy.is_success(v) => {
                    bucket.release(self.success_reward);
                    ControlFlow::Break(())
                }
                Ok(v) => {
                    let admitted = !pays_penalty(v) || bucket.try_acquire(self.failure_cost);
                    if admitted {
                        if let Some(hook) = on_retry {
                            hook(attempt, Ok(v));
                        }
                        ControlFlow::Continue(())
                    } else {
                        ControlFlow::Break(())
                    }
                }
            },
            op,
        )
    }
}
