//! Notification envelopes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::node::Node;
use super::Reason;

/// Delivery feedback events for a previously sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationEvent {
    /// The message could not be delivered; `reason` carries the cause.
    Failed,
    /// An intermediate node accepted the message for routing.
    Accepted,
    /// Deprecated in the protocol; retained for wire compatibility.
    Validated,
    /// Deprecated in the protocol; retained for wire compatibility.
    Authorized,
    /// The message left the sender's domain towards the destination.
    Dispatched,
    /// The destination node received the message.
    Received,
    /// The destination application consumed the message.
    Consumed,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Failed => "failed",
            Self::Accepted => "accepted",
            Self::Validated => "validated",
            Self::Authorized => "authorized",
            Self::Dispatched => "dispatched",
            Self::Received => "received",
            Self::Consumed => "consumed",
        };
        f.write_str(name)
    }
}

/// An envelope reporting a delivery event for a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Id of the message this notification refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,

    /// Optional via-node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,

    /// Destination address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,

    /// The reported event.
    pub event: NotificationEvent,

    /// Failure cause, present when `event` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,

    /// Extension metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Notification {
    /// Creates a notification for the given event.
    pub fn new(event: NotificationEvent) -> Self {
        Self {
            id: None,
            from: None,
            pp: None,
            to: None,
            event,
            reason: None,
            metadata: None,
        }
    }

    /// Creates a `failed` notification carrying a reason.
    pub fn failure(reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(NotificationEvent::Failed)
        }
    }

    /// Sets the id of the message this notification refers to.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
