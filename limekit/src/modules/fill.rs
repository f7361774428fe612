//! Recipient filling.

use super::{ChannelModule, ModuleFuture, ModuleOutcome};
use crate::envelope::{Envelope, Node};

/// Fills absent `from`/`to` fields from the channel's node identities.
///
/// On send, an absent `from` becomes the local node and an absent `to`
/// the remote node; on receive the fill is symmetric.
pub struct RecipientFiller {
    local: Option<Node>,
    remote: Option<Node>,
}

impl RecipientFiller {
    /// Creates a filler for the given local/remote identities.
    ///
    /// A `None` identity leaves the corresponding field untouched.
    pub fn new(local: Option<Node>, remote: Option<Node>) -> Self {
        Self { local, remote }
    }
}

impl ChannelModule for RecipientFiller {
    fn name(&self) -> &str {
        "recipient-filler"
    }

    fn on_sending(&self, mut envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
        if envelope.from().is_none() {
            envelope.set_from(self.local.clone());
        }
        if envelope.to().is_none() {
            envelope.set_to(self.remote.clone());
        }
        Box::pin(async move { Ok(Some(envelope)) })
    }

    fn on_receiving(&self, mut envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
        if envelope.from().is_none() {
            envelope.set_from(self.remote.clone());
        }
        if envelope.to().is_none() {
            envelope.set_to(self.local.clone());
        }
        Box::pin(async move { Ok(Some(envelope)) })
    }
}
