//! In-memory loopback transport.
//!
//! [`pair`] returns two connected transports backed by bounded channels,
//! giving tests and local demos a full-fidelity duplex link: bounded
//! buffering (and therefore backpressure), graceful end-of-stream when a
//! side closes, and the closing-deferral protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, RwLock};

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use super::{
    ClosingListener, Transport, TransportError, TransportEvent, CLOSING_DEFERRAL_TIMEOUT,
};
use crate::envelope::Envelope;

/// Default per-direction buffer of a loopback pair.
pub const DEFAULT_LOOPBACK_CAPACITY: usize = 32;

/// One side of an in-memory duplex link.
pub struct LoopbackTransport {
    /// Envelopes going out to the peer. Taken on close so the peer sees
    /// end-of-stream.
    outgoing: StdMutex<Option<mpsc::Sender<Envelope>>>,

    /// Envelopes arriving from the peer. The channel core guarantees a
    /// single concurrent receiver; the mutex enforces it.
    incoming: Mutex<mpsc::Receiver<Envelope>>,

    connected: AtomicBool,
    close_started: AtomicBool,
    closing_listeners: RwLock<Vec<ClosingListener>>,
    events_tx: broadcast::Sender<TransportEvent>,
}

/// Creates a connected loopback pair with the default buffer capacity.
pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
    pair_with_capacity(DEFAULT_LOOPBACK_CAPACITY)
}

/// Creates a connected loopback pair with an explicit per-direction
/// buffer capacity.
pub fn pair_with_capacity(capacity: usize) -> (LoopbackTransport, LoopbackTransport) {
    let (left_tx, right_rx) = mpsc::channel(capacity.max(1));
    let (right_tx, left_rx) = mpsc::channel(capacity.max(1));

    (
        LoopbackTransport::new(left_tx, left_rx),
        LoopbackTransport::new(right_tx, right_rx),
    )
}

impl LoopbackTransport {
    fn new(outgoing: mpsc::Sender<Envelope>, incoming: mpsc::Receiver<Envelope>) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            outgoing: StdMutex::new(Some(outgoing)),
            incoming: Mutex::new(incoming),
            connected: AtomicBool::new(true),
            close_started: AtomicBool::new(false),
            closing_listeners: RwLock::new(Vec::new()),
            events_tx,
        }
    }

    fn outgoing_sender(&self) -> Result<mpsc::Sender<Envelope>, TransportError> {
        self.outgoing
            .lock()
            .expect("loopback sender lock poisoned")
            .clone()
            .ok_or(TransportError::Closed)
    }

    /// Invokes closing listeners and awaits their deferrals, bounded by
    /// [`CLOSING_DEFERRAL_TIMEOUT`].
    async fn await_closing_deferrals(&self) {
        let deferrals: Vec<_> = {
            let listeners = self
                .closing_listeners
                .read()
                .expect("closing listener lock poisoned");
            listeners.iter().map(|listener| listener()).collect()
        };

        if deferrals.is_empty() {
            return;
        }

        let count = deferrals.len();
        let waited = tokio::time::timeout(
            CLOSING_DEFERRAL_TIMEOUT,
            futures::future::join_all(deferrals),
        )
        .await;

        if waited.is_err() {
            warn!(
                deferrals = count,
                timeout_ms = CLOSING_DEFERRAL_TIMEOUT.as_millis() as u64,
                "Closing deferrals did not resolve in time; tearing down anyway"
            );
        }
    }
}

impl Transport for LoopbackTransport {
    async fn open(&self, _uri: &str) -> Result<(), TransportError> {
        if self.close_started.load(Ordering::SeqCst) {
            return Err(TransportError::Open("transport already closed".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let sender = self.outgoing_sender()?;
        sender
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<Envelope>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        Ok(incoming.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Loopback transport closing");
        let _ = self.events_tx.send(TransportEvent::Closing);

        self.await_closing_deferrals().await;

        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender ends the peer's stream gracefully.
        self.outgoing
            .lock()
            .expect("loopback sender lock poisoned")
            .take();

        let _ = self.events_tx.send(TransportEvent::Closed);
        debug!("Loopback transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_closing(&self, listener: ClosingListener) {
        self.closing_listeners
            .write()
            .expect("closing listener lock poisoned")
            .push(listener);
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
