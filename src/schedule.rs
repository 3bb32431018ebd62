//! Immutable descriptions of inter-attempt delays.
//!
//! A [`Schedule`] says how long to wait before each retry and how many
//! retries it is good for. Schedules compose: [`Schedule::fallback_to`]
//! chains a second schedule after the first one's budget is spent, and
//! [`Schedule::forever`] repeats an inner schedule, resetting it at each
//! end.

use std::time::Duration;

/// Randomization applied to a computed backoff, to spread simultaneous
/// retriers apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the computed delay as-is.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    Equal,
    /// Uniform in `[initial, 3 * last_delay]` (decorrelated backoff).
    Decorrelated,
}

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Up to `max_retries` retries with no delay.
    Immediate { max_retries: u64 },
    /// Up to `max_retries` retries, `delay` apart.
    Delay { max_retries: u64, delay: Duration },
    /// Exponential backoff: `initial * factor^(retry - 1)`, capped.
    Exponential {
        max_retries: u64,
        initial: Duration,
        factor: f64,
        cap: Duration,
        jitter: Jitter,
    },
    /// Repeats `inner`, resetting it each time its budget runs out.
    Forever(Box<Schedule>),
    /// `first` until its budget is spent, then `second`.
    FallbackTo(Box<Schedule>, Box<Schedule>),
}

impl Schedule {
    pub fn immediate(max_retries: u64) -> Self {
        Schedule::Immediate { max_retries }
    }

    pub fn immediate_forever() -> Self {
        Schedule::Forever(Box::new(Self::immediate(1)))
    }

    pub fn delay(max_retries: u64, delay: Duration) -> Self {
        Schedule::Delay { max_retries, delay }
    }

    pub fn delay_forever(delay: Duration) -> Self {
        Schedule::Forever(Box::new(Self::delay(1, delay)))
    }

    /// Exponential backoff with factor 2, a 1 minute cap and no jitter;
    /// adjust with [`with_factor`](Self::with_factor) /
    /// [`with_cap`](Self::with_cap) / [`with_jitter`](Self::with_jitter).
    pub fn exponential(max_retries: u64, initial: Duration) -> Self {
        Schedule::Exponential {
            max_retries,
            initial,
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: Jitter::None,
        }
    }

    pub fn with_factor(self, new_factor: f64) -> Self {
        match self {
            Schedule::Exponential {
                max_retries,
                initial,
                cap,
                jitter,
                ..
            } => Schedule::Exponential {
                max_retries,
                initial,
                factor: new_factor,
                cap,
                jitter,
            },
            other => other,
        }
    }

    pub fn with_cap(self, new_cap: Duration) -> Self {
        match self {
            Schedule::Exponential {
                max_retries,
                initial,
                factor,
                jitter,
                ..
            } => Schedule::Exponential {
                max_retries,
                initial,
                factor,
                cap: new_cap,
                jitter,
            },
            other => other,
        }
    }

    pub fn with_jitter(self, new_jitter: Jitter) -> Self {
        match self {
            Schedule::Exponential {
                max_retries,
                initial,
                factor,
                cap,
                ..
            } => Schedule::Exponential {
                max_retries,
                initial,
                factor,
                cap,
                jitter: new_jitter,
            },
            other => other,
        }
    }

    /// This schedule, then `other` once this one's budget is spent.
    pub fn fallback_to(self, other: Schedule) -> Self {
        Schedule::FallbackTo(Box::new(self), Box::new(other))
    }

    /// This schedule repeated without end.
    pub fn forever(self) -> Self {
        Schedule::Forever(Box::new(self))
    }

    /// Total retry budget; `None` means unbounded.
    pub fn max_retries(&self) -> Option<u64> {
        match self {
            Schedule::Immediate { max_retries }
            | Schedule::Delay { max_retries, .. }
            | Schedule::Exponential { max_retries, .. } => Some(*max_retries),
            Schedule::Forever(_) => None,
            Schedule::FallbackTo(first, second) => {
                Some(first.max_retries()?.saturating_add(second.max_retries()?))
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.max_retries().is_some()
    }

    /// Delay before retry number `retry` (1-based). `last_delay` is what the
    /// previous call returned, for decorrelated jitter.
    pub fn next_delay(&self, retry: u64, last_delay: Option<Duration>) -> Duration {
        match self {
            Schedule::Immediate { .. } => Duration::ZERO,
            Schedule::Delay { delay, .. } => *delay,
            Schedule::Exponential {
                initial,
                factor,
                cap,
                jitter,
                ..
            } => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u64) as i32;
                let backoff = initial.as_secs_f64() * factor.powi(exponent);
                let capped = Duration::from_secs_f64(backoff.min(cap.as_secs_f64()));
                apply_jitter(*jitter, capped, *initial, last_delay)
            }
            Schedule::Forever(inner) => {
                let retry = match inner.max_retries() {
                    Some(budget) if budget > 0 => (retry - 1) % budget + 1,
                    _ => retry,
                };
                inner.next_delay(retry, last_delay)
            }
            Schedule::FallbackTo(first, second) => match first.max_retries() {
                Some(budget) if retry > budget => second.next_delay(retry - budget, last_delay),
                _ => first.next_delay(retry, last_delay),
            },
        }
    }
}

fn apply_jitter(
    jitter: Jitter,
    delay: Duration,
    initial: Duration,
    last_delay: Option<Duration>,
) -> Duration {
    match jitter {
        Jitter::None => delay,
        Jitter::Full => delay.mul_f64(rand::random::<f64>()),
        Jitter::Equal => {
            let half = delay / 2;
            half + half.mul_f64(rand::random::<f64>())
        }
        Jitter::Decorrelated => {
            let last = last_delay.unwrap_or(initial);
            let ceiling = (last * 3).max(initial);
            initial + (ceiling - initial).mul_f64(rand::random::<f64>())
        }
    }
}
