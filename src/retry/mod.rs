//! Retries: a [`RetryConfig`] (schedule + result policy + lifecycle
//! callback) wired into the schedule engine.
//!
//! ```
//! use std::time::Duration;
//! use corral::{retry, RetryConfig, Schedule};
//!
//! let mut attempts = 0;
//! let out: Result<u32, &str> = retry(
//!     &RetryConfig::new(Schedule::immediate(3)),
//!     || {
//!         attempts += 1;
//!         if attempts < 3 { Err("flaky") } else { Ok(attempts) }
//!     },
//! );
//! assert_eq!(out, Ok(3));
//! ```

pub mod adaptive;

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::error_mode::{ErrorMode, ResultMode};
use crate::schedule::Schedule;
use crate::scheduled::{ScheduledConfig, SleepMode, scheduled_with_error_mode};

type SuccessFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type RetryFn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type OnRetryFn<E, T> = Arc<dyn Fn(u64, Result<&T, &E>) + Send + Sync>;

/// Classifies outcomes: which values count as success, which errors are
/// worth another attempt. Defaults: every value succeeds, every error
/// retries.
pub struct ResultPolicy<E, T> {
    is_success: SuccessFn<T>,
    is_worth_retrying: RetryFn<E>,
}

impl<E, T> Clone for ResultPolicy<E, T> {
    fn clone(&self) -> Self {
        Self {
            is_success: Arc::clone(&self.is_success),
            is_worth_retrying: Arc::clone(&self.is_worth_retrying),
        }
    }
}

impl<E, T> Default for ResultPolicy<E, T> {
    fn default() -> Self {
        Self {
            is_success: Arc::new(|_| true),
            is_worth_retrying: Arc::new(|_| true),
        }
    }
}

impl<E, T> ResultPolicy<E, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values failing `f` are treated as failed attempts (and retried).
    pub fn success_if(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.is_success = Arc::new(f);
        self
    }

    /// Errors failing `f` stop the retry loop immediately.
    pub fn retry_if(mut self, f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.is_worth_retrying = Arc::new(f);
        self
    }

    pub(crate) fn is_success(&self, value: &T) -> bool {
        (self.is_success)(value)
    }

    pub(crate) fn is_worth_retrying(&self, error: &E) -> bool {
        (self.is_worth_retrying)(error)
    }
}

pub struct RetryConfig<E, T> {
    pub schedule: Schedule,
    pub sleep_mode: SleepMode,
    pub result_policy: ResultPolicy<E, T>,
    /// Observes every failed attempt that will be retried.
    pub on_retry: Option<OnRetryFn<E, T>>,
}

impl<E, T> Clone for RetryConfig<E, T> {
    fn clone(&self) -> Self {
        Self {
            schedule: self.schedule.clone(),
            sleep_mode: self.sleep_mode,
            result_policy: self.result_policy.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E, T> RetryConfig<E, T> {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            sleep_mode: SleepMode::Delay,
            result_policy: ResultPolicy::default(),
            on_retry: None,
        }
    }

    pub fn with_sleep_mode(mut self, sleep_mode: SleepMode) -> Self {
        self.sleep_mode = sleep_mode;
        self
    }

    pub fn with_result_policy(mut self, policy: ResultPolicy<E, T>) -> Self {
        self.result_policy = policy;
        self
    }

    pub fn on_retry(mut self, f: impl Fn(u64, Result<&T, &E>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    fn scheduled(&self) -> ScheduledConfig {
        ScheduledConfig {
            schedule: self.schedule.clone(),
            sleep_mode: self.sleep_mode,
        }
    }
}

/// Retries a `Result`-returning operation.
pub fn retry<T, E, Op>(config: &RetryConfig<E, T>, op: Op) -> Result<T, E>
where
    Op: FnMut() -> Result<T, E>,
{
    retry_with_error_mode(ResultMode, config, op)
}

/// Retries under an arbitrary error mode: the outcome container is returned
/// unchanged once the policy or the schedule says stop.
pub fn retry_with_error_mode<M, E, T, Op>(
    mode: M,
    config: &RetryConfig<E, T>,
    op: Op,
) -> M::Container<T>
where
    M: ErrorMode<E>,
    Op: FnMut() -> M::Container<T>,
{
    let policy = &config.result_policy;
    let on_retry = config.on_retry.as_deref();
    scheduled_with_error_mode(
        mode,
        &config.scheduled(),
        |attempt, outcome| match mode.peek(outcome) {
            Err(e) if policy.is_worth_retrying(e) => {
                if let Some(hook) = on_retry {
                    hook(attempt, Err(e));
                }
                ControlFlow::Continue(())
            }
            Err(_) => ControlFlow::Break(()),
            Ok(v) if policy.is_success(v) => ControlFlow::Break(()),
            Ok(v) => {
                if let Some(hook) = on_retry {
                    hook(attempt, Ok(v));
                }
                ControlFlow::Continue(())
            }
        },
        op,
    )
}
