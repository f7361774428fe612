//! The channel core: session state machine, send/receive pipelines, and
//! command correlation over one transport.

#[allow(clippy::module_inception)]
mod channel;
mod config;
mod correlator;
mod error;
mod events;
mod queue;
mod receiver;
pub(crate) mod sender;
mod state;

pub use channel::{Channel, ChannelBuilder};
pub use config::{
    ChannelConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_ENVELOPE_BUFFER_SIZE, DEFAULT_SEND_BATCH_SIZE,
    DEFAULT_SEND_FLUSH_INTERVAL, DEFAULT_SEND_TIMEOUT, PIPELINE_STOP_TIMEOUT,
};
pub use correlator::{CommandCorrelator, CorrelatorStats};
pub use error::{ChannelError, QueueDepths};
pub use events::{ChannelEvent, ExceptionSide};

pub(crate) use events::PipelineFailure;
pub(crate) use sender::SenderHandle;
