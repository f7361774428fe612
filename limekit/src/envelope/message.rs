//! Message envelopes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::document::MediaType;
use super::node::Node;

/// A content-carrying envelope with no terminal semantics.
///
/// Messages transport documents between nodes; delivery feedback, when
/// requested, arrives as separate [`Notification`](super::Notification)
/// envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation identifier, optional on messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,

    /// Optional via-node used for delegated sending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,

    /// Destination address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,

    /// Media type of the content document.
    #[serde(rename = "type")]
    pub media_type: MediaType,

    /// The content document.
    ///
    /// Structured JSON for `+json` media types; a JSON string carrying the
    /// document's textual representation otherwise.
    pub content: serde_json::Value,

    /// Extension metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Message {
    /// Creates a plain-text message.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            id: None,
            from: None,
            pp: None,
            to: None,
            media_type: MediaType::text_plain(),
            content: serde_json::Value::String(content.into()),
            metadata: None,
        }
    }

    /// Creates a message carrying a structured JSON document.
    pub fn json(media_type: MediaType, content: serde_json::Value) -> Self {
        Self {
            id: None,
            from: None,
            pp: None,
            to: None,
            media_type,
            content,
            metadata: None,
        }
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the destination address.
    pub fn with_to(mut self, to: Node) -> Self {
        self.to = Some(to);
        self
    }
}
