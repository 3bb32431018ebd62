use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Why a channel stopped accepting work. Cloneable so every pending and
/// future operation can observe the same reason.
#[derive(Debug, Clone, Error)]
pub enum ChannelClosed {
    /// [`Channel::done`](super::Channel::done): no further sends; buffered
    /// values remain receivable.
    #[error("channel is done")]
    Done,
    /// [`Channel::error`](super::Channel::error): the channel failed;
    /// buffered values are discarded.
    #[error("channel failed: {0}")]
    Error(Arc<dyn StdError + Send + Sync>),
}

impl ChannelClosed {
    pub fn is_done(&self) -> bool {
        matches!(self, ChannelClosed::Done)
    }
}

/// Failed [`send`](super::Channel::send). The value is handed back.
#[derive(Debug, Error)]
pub enum SendError<T> {
    #[error("send on closed channel: {0}")]
    Closed(ChannelClosed, T),
    #[error("send interrupted")]
    Interrupted(T),
}

impl<T> SendError<T> {
    /// Recovers the value that was not delivered.
    pub fn into_value(self) -> T {
        match self {
            SendError::Closed(_, v) | SendError::Interrupted(v) => v,
        }
    }
}

/// Failed [`receive`](super::Channel::receive) /
/// [`receive_or_closed`](super::Channel::receive_or_closed).
#[derive(Debug, Clone, Error)]
pub enum RecvError {
    #[error("receive on closed channel: {0}")]
    Closed(ChannelClosed),
    #[error("receive interrupted")]
    Interrupted,
}

/// Failed [`try_send`](super::Channel::try_send). The value is handed back.
#[derive(Debug, Error)]
pub enum TrySendError<T> {
    /// No rendezvous partner and no buffer space right now.
    #[error("channel is full")]
    Full(T),
    #[error("send on closed channel: {0}")]
    Closed(ChannelClosed, T),
}

impl<T> TrySendError<T> {
    pub fn into_value(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(_, v) => v,
        }
    }
}
