//! Automatic ping replies.

use tracing::{debug, warn};

use super::{ChannelModule, ModuleFuture, ModuleOutcome};
use crate::channel::SenderHandle;
use crate::envelope::{ping_document, CommandMethod, Envelope, MediaType};

/// URI of the ping resource.
pub const PING_URI: &str = "/ping";

/// Answers `get /ping` requests without surfacing them to the
/// application.
///
/// The synthesized response echoes the request id, carries a ping
/// document, and is enqueued directly on the send pipeline; the original
/// request is dropped from the receive stream.
pub struct PingAutoReply {
    sender: SenderHandle,
}

impl PingAutoReply {
    pub(crate) fn new(sender: SenderHandle) -> Self {
        Self { sender }
    }
}

impl ChannelModule for PingAutoReply {
    fn name(&self) -> &str {
        "ping-auto-reply"
    }

    fn on_receiving(&self, envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
        Box::pin(async move {
            let command = match envelope {
                Envelope::Command(command) => command,
                other => return Ok(Some(other)),
            };

            let is_ping_request = command.method == CommandMethod::Get
                && command.status.is_pending()
                && command
                    .uri
                    .as_deref()
                    .is_some_and(|uri| uri.eq_ignore_ascii_case(PING_URI))
                && command.id.as_deref().is_some_and(|id| !id.is_empty());

            if !is_ping_request {
                return Ok(Some(Envelope::Command(command)));
            }

            debug!(id = ?command.id, "Answering ping request");
            let reply = command
                .success_response()
                .with_resource(MediaType::ping(), ping_document());

            if let Err(err) = self.sender.send_detached(reply.into()).await {
                warn!(error = %err, "Failed to enqueue ping reply");
            }

            Ok(None)
        })
    }
}
