//! Channel construction parameters.

use std::time::Duration;

use crate::envelope::Node;

/// Default bound on each send operation.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on closing the transport.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the intake buffer and each ready queue.
pub const DEFAULT_ENVELOPE_BUFFER_SIZE: usize = 64;

/// Default number of envelopes flushed to the transport per batch.
///
/// A batch size of 1 disables batching.
pub const DEFAULT_SEND_BATCH_SIZE: usize = 1;

/// Default interval after which a partially filled batch is flushed.
pub const DEFAULT_SEND_FLUSH_INTERVAL: Duration = Duration::from_millis(5);

/// Bound on stopping the pipeline tasks during close.
pub const PIPELINE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Construction parameters for a [`Channel`](super::Channel).
///
/// Values are fixed at construction; the channel never reconfigures
/// itself mid-session.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound on each send operation. On expiry the channel closes.
    pub send_timeout: Duration,

    /// Bound on enqueueing a received envelope when the application is
    /// not draining. `None` disables the check (a stuck consumer then
    /// blocks the transport reader indefinitely).
    pub consume_timeout: Option<Duration>,

    /// Bound on closing the transport. Must be non-zero.
    pub close_timeout: Duration,

    /// Capacity of the intake buffer and each per-type ready queue.
    /// Zero means unbounded.
    pub envelope_buffer_size: usize,

    /// Number of envelopes flushed to the transport per batch.
    /// 1 disables batching.
    pub send_batch_size: usize,

    /// Interval after which a partially filled batch is flushed.
    pub send_flush_interval: Duration,

    /// Fill absent `from`/`to` fields from the local/remote node.
    pub fill_envelope_recipients: bool,

    /// Automatically answer `/ping` requests without surfacing them to
    /// the application.
    pub auto_reply_pings: bool,

    /// Interval between watchdog ping requests once established.
    /// `None` disables the remote-ping watchdog.
    pub remote_ping_interval: Option<Duration>,

    /// Close the channel when no envelope arrives for this long.
    /// Only effective together with `remote_ping_interval`.
    pub remote_idle_timeout: Option<Duration>,

    /// Identity of the local node, used by recipient filling.
    pub local_node: Option<Node>,

    /// Identity of the remote node, used by recipient filling.
    pub remote_node: Option<Node>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            consume_timeout: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            envelope_buffer_size: DEFAULT_ENVELOPE_BUFFER_SIZE,
            send_batch_size: DEFAULT_SEND_BATCH_SIZE,
            send_flush_interval: DEFAULT_SEND_FLUSH_INTERVAL,
            fill_envelope_recipients: false,
            auto_reply_pings: false,
            remote_ping_interval: None,
            remote_idle_timeout: None,
            local_node: None,
            remote_node: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.send_timeout, DEFAULT_SEND_TIMEOUT);
        assert_eq!(config.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert_eq!(config.send_batch_size, 1);
        assert!(config.consume_timeout.is_none());
        assert!(!config.auto_reply_pings);
    }
}
