//! Structured Concurrency for Threads
//!
//! corral bounds the lifetime of concurrent work by lexical scope: forks
//! spawned into a [`supervised`] or [`scoped`] block are guaranteed to have
//! terminated before the block returns, failures propagate to exactly one
//! place, and cancellation is cooperative and deterministic.
//!
//! Three layers build on each other:
//!
//! - **Scopes & forks** ([`supervised`], [`scoped`], [`supervised_err`],
//!   [`Scope`]): structured spawning with daemon/user distinction,
//!   application-error propagation and interrupt-based teardown.
//! - **Rendezvous channels** ([`Channel`]): a lock-free, cell-indexed
//!   handoff between forks, unbuffered or buffered, FIFO per side, with
//!   interruptible blocking operations and orderly/erroneous closure.
//! - **Resilience** ([`retry`], [`AdaptiveRetry`], [`RateLimiter`],
//!   [`DurationRateLimiter`]): a schedule engine driving retries and rate
//!   limiters as operations inside scopes.
//!
//! ## Example
//!
//! ```
//! use corral::{Channel, supervised};
//!
//! let ch = Channel::<i32>::rendezvous();
//! let doubled = supervised(|scope| {
//!     scope.fork(|| {
//!         for i in 1..=3 {
//!             ch.send(i).unwrap();
//!         }
//!         ch.done();
//!     });
//!     let mut out = Vec::new();
//!     while let Some(v) = ch.receive_or_closed().unwrap() {
//!         out.push(v * 2);
//!     }
//!     out
//! });
//! assert_eq!(doubled, vec![2, 4, 6]);
//! ```
//!
//! ## Blocking model
//!
//! Forks are carried by OS threads; every blocking operation in this crate
//! (channel send/receive, [`Fork::join`], [`sleep`], rate-limiter acquire)
//! parks the thread and is woken either by progress or by the scope
//! interrupting the carrier, in which case it returns [`Interrupted`].

pub mod channel;
pub mod error_mode;
pub mod flow;
mod interrupt;
mod park;
pub mod rate_limiter;
pub mod retry;
pub mod schedule;
pub mod scheduled;
pub mod scope;

pub use channel::{Channel, ChannelClosed, RecvError, SendError, TrySendError};
pub use error_mode::{ErrorMode, OptionMode, ResultMode};
pub use flow::{ChannelSink, FlowSink, FlowStage};
pub use interrupt::{Interrupted, sleep};
pub use rate_limiter::{DurationRateLimiter, RateLimiter};
pub use retry::adaptive::{AdaptiveRetry, TokenBucket};
pub use retry::{ResultPolicy, RetryConfig, retry, retry_with_error_mode};
pub use schedule::{Jitter, Schedule};
pub use scheduled::{ScheduledConfig, SleepMode, scheduled_with_error_mode};
pub use scope::{
    CancellableFork, ErrScope, Fork, ForkAll, JoinError, Scope, scoped, supervised, supervised_err,
};
