//! The schedule engine: runs an operation repeatedly under a [`Schedule`],
//! consulting a per-attempt hook between attempts.
//!
//! The engine never unwinds: outcomes are classified through the error mode
//! and either consumed (another attempt) or returned unchanged (stop). An
//! interrupt during the inter-attempt sleep also stops the loop — the
//! enclosing fork is being torn down, so the last outcome is simply handed
//! back.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error_mode::ErrorMode;
use crate::interrupt;
use crate::schedule::Schedule;

/// How the inter-attempt delay relates to attempt duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepMode {
    /// Sleep the full delay between the end of one attempt and the start of
    /// the next.
    #[default]
    Delay,
    /// Pace to an interval: the sleep is reduced by how long the attempt
    /// itself took.
    Interval,
}

#[derive(Debug, Clone)]
pub struct ScheduledConfig {
    pub schedule: Schedule,
    pub sleep_mode: SleepMode,
}

impl ScheduledConfig {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            sleep_mode: SleepMode::Delay,
        }
    }

    pub fn with_sleep_mode(mut self, sleep_mode: SleepMode) -> Self {
        self.sleep_mode = sleep_mode;
        self
    }
}

/// Runs `op` under `config`'s schedule until either the schedule's retry
/// budget is spent or `after_attempt` breaks; returns the last outcome
/// unchanged, in the mode's container.
///
/// `after_attempt` sees the 1-based attempt number and the outcome; it is
/// where retry policies, token buckets and lifecycle callbacks hook in.
pub fn scheduled_with_error_mode<M, E, T, Op, Hook>(
    _mode: M,
    config: &ScheduledConfig,
    mut after_attempt: Hook,
    mut op: Op,
) -> M::Container<T>
where
    M: ErrorMode<E>,
    Op: FnMut() -> M::Container<T>,
    Hook: FnMut(u64, &M::Container<T>) -> ControlFlow<()>,
{
    let mut attempt: u64 = 1;
    let mut last_delay: Option<Duration> = None;
    loop {
        let started = Instant::now();
        let outcome = op();

        if after_attempt(attempt, &outcome).is_break() {
            return outcome;
        }
        let budget_left = config.schedule.max_retries().is_none_or(|n| attempt <= n);
        if !budget_left {
            return outcome;
        }

        let delay = config.schedule.next_delay(attempt, last_delay);
        last_delay = Some(delay);
        let sleep_for = match config.sleep_mode {
            SleepMode::Delay => delay,
            SleepMode::Interval => delay.saturating_sub(started.elapsed()),
        };
        trace!(
            target: "corral::retry",
            attempt,
            sleep_ms = sleep_for.as_millis() as u64,
            "retrying"
        );
        if !sleep_for.is_zero() && interrupt::sleep(sleep_for).is_err() {
            return outcome;
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_mode::ResultMode;
    use std::time::Instant;

    /// The hook sees every attempt and its break stops the loop.
    #[test]
    fn test_hook_drives_loop() {
        let mut seen = Vec::new();
        let mut calls = 0u64;
        let config = ScheduledConfig::new(Schedule::immediate(10));
        let out: Result<u64, ()> = scheduled_with_error_mode(
            ResultMode,
            &config,
            |attempt, outcome: &Result<u64, ()>| {
                seen.push((attempt, *outcome));
                if attempt == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
            || {
                calls += 1;
                Ok(calls)
            },
        );
        assert_eq!(out, Ok(3));
        assert_eq!(seen.len(), 3);
    }

    /// An exhausted budget returns the last outcome unchanged.
    #[test]
    fn test_budget_exhaustion() {
        let mut calls = 0u32;
        let config = ScheduledConfig::new(Schedule::immediate(4));
        let out: Result<u32, u32> = scheduled_with_error_mode(
            ResultMode,
            &config,
            |_, _| ControlFlow::Continue(()),
            || {
                calls += 1;
                Err(calls)
            },
        );
        assert_eq!(out, Err(5));
        assert_eq!(calls, 5);
    }

    /// Interval mode subtracts the attempt's own duration from the sleep.
    #[test]
    fn test_interval_pacing() {
        let config = ScheduledConfig::new(Schedule::delay(2, Duration::from_millis(50)))
            .with_sleep_mode(SleepMode::Interval);
        let started = Instant::now();
        let _: Result<(), ()> = scheduled_with_error_mode(
            ResultMode,
            &config,
            |_, _| ControlFlow::Continue(()),
            || {
                std::thread::sleep(Duration::from_millis(30));
                Err(())
            },
        );
        let elapsed = started.elapsed();
        // 3 attempts of 30ms, 2 inter-attempt sleeps of 50-30=20ms.
        assert!(elapsed >= Duration::from_millis(130));
        assert!(elapsed < Duration::from_millis(250));
    }
}
