//! The transport contract consumed by the channel core.
//!
//! A transport is a duplex envelope pipe with an explicit lifecycle. The
//! channel core guarantees at most one concurrent `send` and at most one
//! concurrent `receive` caller; implementations may rely on that.
//!
//! # Closing deferrals
//!
//! Before a transport tears down its connection it invokes every
//! registered closing listener. Each listener returns a future (its
//! *deferral*); the transport must await all deferrals, bounded by
//! [`CLOSING_DEFERRAL_TIMEOUT`], before finishing the close. This gives
//! the channel a window to run its own shutdown when the close is
//! initiated by the peer.

mod loopback;

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::envelope::Envelope;

pub use loopback::{pair, pair_with_capacity, LoopbackTransport};

/// Wall-clock bound on awaiting closing deferrals.
pub const CLOSING_DEFERRAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connecting to the remote endpoint failed.
    #[error("transport open failed: {0}")]
    Open(String),

    /// The operation requires a connected transport.
    #[error("transport is not connected")]
    NotConnected,

    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// An I/O failure on the underlying connection.
    #[error("transport i/o failure: {0}")]
    Io(String),
}

/// Lifecycle events emitted by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport is about to tear down its connection. Emitted before
    /// closing deferrals are awaited.
    Closing,

    /// The transport finished tearing down. Emitted exactly once.
    Closed,
}

/// A closing listener: invoked synchronously when the transport starts
/// closing, returning a deferral the transport awaits before finishing.
pub type ClosingListener = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Duplex envelope transport.
pub trait Transport: Send + Sync + 'static {
    /// Connects to the remote endpoint identified by `uri`.
    fn open(&self, uri: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends one envelope, blocking until it is handed to the wire or the
    /// caller cancels.
    fn send(&self, envelope: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next envelope.
    ///
    /// Returns `Ok(None)` only on graceful end-of-stream.
    fn receive(&self) -> impl Future<Output = Result<Option<Envelope>, TransportError>> + Send;

    /// Initiates an orderly shutdown. Idempotent.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns true while the transport can carry envelopes.
    fn is_connected(&self) -> bool;

    /// Registers a closing listener whose deferral is awaited during close.
    fn on_closing(&self, listener: ClosingListener);

    /// Subscribes to lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
