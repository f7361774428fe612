//! Command request/response correlation.
//!
//! A caller issuing a request registers a single-shot slot keyed by the
//! command id; the receive pipeline fulfills the slot when a response
//! with the same id arrives. Uses `DashMap` with the entry API for atomic
//! check-and-insert, so concurrent registrations for the same id resolve
//! to exactly one winner.
//!
//! Commands with `method = observe` bypass correlation entirely in both
//! directions; they are broadcast-style notifications, not requests.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use super::error::ChannelError;
use crate::envelope::{Command, CommandMethod};

/// Statistics for monitoring correlation behavior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorStats {
    /// Requests registered.
    pub registered: u64,
    /// Responses matched to a pending slot.
    pub matched: u64,
    /// Responses that found no pending slot.
    pub unmatched: u64,
    /// Slots canceled before a response arrived.
    pub canceled: u64,
}

/// The pending-command table.
///
/// Shareable across channels: entries are keyed by request id and
/// disjoint per request, so a correlator injected into several channels
/// behaves the same as one per channel.
pub struct CommandCorrelator {
    pending: DashMap<String, oneshot::Sender<Command>>,
    registered: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    canceled: AtomicU64,
}

impl CommandCorrelator {
    /// Creates an empty correlator.
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            registered: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
        }
    }

    /// Registers a pending request, returning the receiver its response
    /// will be delivered on.
    ///
    /// Fails with `InvalidArgument` when the command is not a pending
    /// request with a non-empty id, or when its method is `observe`;
    /// fails with `DuplicateCommand` when a request with the same id is
    /// already pending.
    pub fn register(&self, request: &Command) -> Result<oneshot::Receiver<Command>, ChannelError> {
        if !request.status.is_pending() {
            return Err(ChannelError::InvalidArgument(
                "command request must have pending status".into(),
            ));
        }
        if request.method == CommandMethod::Observe {
            return Err(ChannelError::InvalidArgument(
                "observe commands are exempt from correlation".into(),
            ));
        }
        let id = match request.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(ChannelError::InvalidArgument(
                    "command request requires a non-empty id".into(),
                ))
            }
        };

        let rx = match self.pending.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ChannelError::DuplicateCommand { id });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                rx
            }
        };

        self.registered.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, pending = self.pending.len(), "Command registered for correlation");
        Ok(rx)
    }

    /// Delivers a response to its pending slot.
    ///
    /// Returns `Ok(())` when a slot was fulfilled. Returns the response
    /// back when no slot matches: the id is unknown, already fulfilled,
    /// or the command does not participate in correlation (pending
    /// status, `observe` method, or missing id).
    pub fn try_submit_result(&self, response: Command) -> Result<(), Command> {
        if !response.is_correlatable_response() {
            return Err(response);
        }
        let id = response.id.as_deref().unwrap_or_default().to_string();

        let Some((_, slot)) = self.pending.remove(&id) else {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            return Err(response);
        };

        match slot.send(response) {
            Ok(()) => {
                self.matched.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, "Command response matched");
                Ok(())
            }
            // The waiter went away between removal and delivery.
            Err(response) => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                Err(response)
            }
        }
    }

    /// Removes a pending slot without fulfilling it.
    ///
    /// Called when the awaiting operation is canceled or fails to send;
    /// a response arriving later will find no slot.
    pub fn remove(&self, id: &str) {
        if self.pending.remove(id).is_some() {
            self.canceled.fetch_add(1, Ordering::Relaxed);
            debug!(id = %id, "Pending command removed");
        }
    }

    /// Cancels every outstanding slot and empties the table.
    ///
    /// Dropping a slot wakes its waiter with a cancellation.
    pub fn cancel_all(&self) {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            self.canceled.fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "Canceled all pending commands");
        }
    }

    /// Returns the number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns a snapshot of the correlation statistics.
    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            registered: self.registered.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
