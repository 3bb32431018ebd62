//! Contract consumed by the stream-combinator collaborator.
//!
//! A [`FlowStage`] is anything that can push items into a [`FlowSink`]. The
//! core guarantees nothing about *what* stages exist (the operator catalog
//! lives elsewhere); it guarantees the callback discipline: a sink's
//! callbacks are invoked from a single producer, in order, and exactly one
//! of `on_done` / `on_error` terminates the stream.

use std::error::Error as StdError;

use thiserror::Error;

use crate::channel::Channel;

/// Where a running stage pushes its output.
pub trait FlowSink<T> {
    fn on_next(&mut self, item: T);
    fn on_done(&mut self);
    fn on_error(&mut self, error: Box<dyn StdError + Send + Sync>);
}

/// A source of items that runs to completion, pushing into the given sink.
pub trait FlowStage<T> {
    fn run(self, sink: &mut dyn FlowSink<T>);
}

/// Any iterator is a stage.
impl<T, I> FlowStage<T> for I
where
    I: IntoIterator<Item = T>,
{
    fn run(self, sink: &mut dyn FlowSink<T>) {
        for item in self {
            sink.on_next(item);
        }
        sink.on_done();
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct StageError(Box<dyn StdError + Send + Sync>);

/// Bridges a stage into a [`Channel`]: items are sent (blocking, so the
/// channel's capacity backpressures the stage), completion closes it.
///
/// Run the stage in a fork and consume the channel elsewhere in the scope.
pub struct ChannelSink<'a, T> {
    channel: &'a Channel<T>,
}

impl<'a, T> ChannelSink<'a, T> {
    pub fn new(channel: &'a Channel<T>) -> Self {
        Self { channel }
    }
}

impl<T> FlowSink<T> for ChannelSink<'_, T> {
    fn on_next(&mut self, item: T) {
        // A closed/interrupted consumer ends the stream early; the stage
        // has nowhere to report it, which is fine — the channel already
        // carries the closure to the consumer side.
        let _ = self.channel.send(item);
    }

    fn on_done(&mut self) {
        self.channel.done();
    }

    fn on_error(&mut self, error: Box<dyn StdError + Send + Sync>) {
        self.channel.error(StageError(error));
    }
}
