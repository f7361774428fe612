//! Error types for the channel core.
//!
//! Errors split into two groups: those returned to the calling operation
//! while the channel stays open (invalid argument/state, duplicate
//! correlation, cancellation), and those that trigger the closing protocol
//! (timeouts, transport failures, module failures).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::SessionState;
use crate::transport::TransportError;

/// Per-type ready-queue depths, included in consume-timeout diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    /// Buffered messages awaiting `receive_message`.
    pub messages: usize,
    /// Buffered notifications awaiting `receive_notification`.
    pub notifications: usize,
    /// Buffered commands awaiting `receive_command`.
    pub commands: usize,
    /// Buffered sessions awaiting `receive_session`.
    pub sessions: usize,
}

impl fmt::Display for QueueDepths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "messages={} notifications={} commands={} sessions={}",
            self.messages, self.notifications, self.commands, self.sessions
        )
    }
}

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A malformed envelope was handed to the API.
    #[error("invalid envelope: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current session state.
    #[error("operation not allowed in session state '{state}'")]
    InvalidState {
        /// The state the channel was in.
        state: SessionState,
    },

    /// A command with the same id is already awaiting a response.
    #[error("a command with id '{id}' is already pending")]
    DuplicateCommand {
        /// The colliding correlation id.
        id: String,
    },

    /// A send did not complete within the configured send timeout.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// The application did not drain the ready queues within the consume
    /// timeout; the depths identify the stuck queue.
    #[error("envelope consumer timed out after {timeout:?}; ready queues: {depths}")]
    ConsumeTimeout {
        /// The configured consume timeout.
        timeout: Duration,
        /// Per-type ready-queue depths at the time of the timeout.
        depths: QueueDepths,
    },

    /// Closing the transport did not complete within the close timeout.
    #[error("transport close timed out after {0:?}")]
    CloseTimeout(Duration),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The caller canceled the operation, or the channel closed while the
    /// operation was pending.
    #[error("operation canceled")]
    Canceled,

    /// The channel has already terminated.
    #[error("channel closed")]
    Closed,

    /// A registered module failed while processing an envelope.
    #[error("module '{module}' failed: {message}")]
    Module {
        /// Name of the failing module.
        module: String,
        /// The module's failure description.
        message: String,
    },

    /// No envelope was received within the remote idle timeout.
    #[error("remote peer idle for {0:?}")]
    RemoteIdle(Duration),
}

impl ChannelError {
    /// Returns true if this error triggers the closing protocol.
    ///
    /// Argument, state, duplicate, and cancellation errors are returned to
    /// the caller with the channel left open; everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidState { .. }
                | Self::DuplicateCommand { .. }
                | Self::Canceled
        )
    }
}
