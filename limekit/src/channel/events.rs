//! Observable channel events and internal failure routing.

use std::fmt;
use std::sync::Arc;

use super::error::ChannelError;

/// Which side of the channel a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionSide {
    /// The send pipeline (caller-facing sends, batcher, transport writes).
    Sender,
    /// The receive pipeline (transport reads, demux, modules, consumers).
    Consumer,
}

impl fmt::Display for ExceptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// Events observable on a channel.
///
/// Exception events carry the failure that triggered the closing
/// protocol; `Closing`/`Closed` are forwarded from the transport.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The receive pipeline failed; the channel is closing.
    ConsumerException(Arc<ChannelError>),
    /// The send pipeline failed; the channel is closing.
    SenderException(Arc<ChannelError>),
    /// The transport is about to tear down.
    Closing,
    /// The transport finished tearing down.
    Closed,
}

/// A failure reported by a pipeline task to the exception dispatcher.
#[derive(Debug)]
pub(crate) struct PipelineFailure {
    pub(crate) side: ExceptionSide,
    /// `None` marks a graceful end-of-stream from the peer: the channel
    /// closes without raising an exception event.
    pub(crate) error: Option<ChannelError>,
}

impl PipelineFailure {
    pub(crate) fn consumer(error: ChannelError) -> Self {
        Self {
            side: ExceptionSide::Consumer,
            error: Some(error),
        }
    }

    pub(crate) fn sender(error: ChannelError) -> Self {
        Self {
            side: ExceptionSide::Sender,
            error: Some(error),
        }
    }

    pub(crate) fn remote_eof() -> Self {
        Self {
            side: ExceptionSide::Consumer,
            error: None,
        }
    }
}
