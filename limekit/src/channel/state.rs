//! Session state tracking.
//!
//! The channel derives its state from the last session envelope it sent
//! or received. The tracker broadcasts transitions so long-lived tasks
//! (receiver start, watchdog) can react without polling.

use tokio::sync::watch;
use tracing::debug;

use super::error::ChannelError;
use crate::envelope::SessionState;

/// Owns the current session state and broadcasts transitions.
pub(crate) struct SessionStateTracker {
    tx: watch::Sender<SessionState>,
}

impl SessionStateTracker {
    /// Creates a tracker in the `new` state.
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::New);
        Self { tx }
    }

    /// Returns the current state.
    pub(crate) fn state(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Subscribes to state transitions.
    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Moves to `next`, returning the previous state.
    ///
    /// Fails with [`ChannelError::Closed`] when the current state is
    /// terminal; terminal states are never left.
    pub(crate) fn transition(&self, next: SessionState) -> Result<SessionState, ChannelError> {
        let mut previous = self.state();
        let mut rejected = false;

        self.tx.send_modify(|current| {
            previous = *current;
            if current.is_terminal() {
                rejected = true;
            } else if *current != next {
                *current = next;
            }
        });

        if rejected {
            return Err(ChannelError::Closed);
        }

        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
        }
        Ok(previous)
    }
}
