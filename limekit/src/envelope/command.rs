//! Command envelopes.
//!
//! A command with `status = pending` is a *request*; a command with any
//! other status is a *response* and reuses the request's `id`. Requests
//! omit the `status` field on the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::document::MediaType;
use super::node::Node;
use super::Reason;

/// Resource manipulation methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandMethod {
    /// Fetch a resource.
    Get,
    /// Create or replace a resource.
    Set,
    /// Remove a resource.
    Delete,
    /// Subscribe to resource change events.
    Subscribe,
    /// Cancel a subscription.
    Unsubscribe,
    /// Broadcast-style resource observation; exempt from request/response
    /// correlation.
    Observe,
    /// Merge fields into an existing resource.
    Merge,
}

impl fmt::Display for CommandMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Observe => "observe",
            Self::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Processing status of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    /// The command awaits processing; this is the request state and is
    /// omitted on the wire.
    #[default]
    Pending,
    /// The command was processed successfully.
    Success,
    /// The command failed; `reason` carries the cause.
    Failure,
}

impl CommandStatus {
    /// Returns true for the request state.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A request/response envelope for resource manipulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation identifier; required on requests expecting a response.
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

    /// The method to apply to the resource.
    pub method: CommandMethod,

    /// The resource URI the method applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Media type of the resource document.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// The resource document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,

    /// Processing status; omitted on requests.
    #[serde(default, skip_serializing_if = "CommandStatus::is_pending")]
    pub status: CommandStatus,

    /// Failure cause, present when `status` is `failure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,

    /// Extension metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Command {
    /// Creates a pending request for the given method and URI.
    pub fn request(method: CommandMethod, uri: impl Into<String>) -> Self {
        Self {
            id: None,
            from: None,
            pp: None,
            to: None,
            method,
            uri: Some(uri.into()),
            media_type: None,
            resource: None,
            status: CommandStatus::Pending,
            reason: None,
            metadata: None,
        }
    }

    /// Creates a success response to this request, echoing its id.
    ///
    /// The response is addressed back to the request's sender.
    pub fn success_response(&self) -> Self {
        Self {
            id: self.id.clone(),
            from: None,
            pp: None,
            to: self.from.clone(),
            method: self.method,
            uri: None,
            media_type: None,
            resource: None,
            status: CommandStatus::Success,
            reason: None,
            metadata: None,
        }
    }

    /// Creates a failure response to this request, echoing its id.
    pub fn failure_response(&self, reason: Reason) -> Self {
        Self {
            status: CommandStatus::Failure,
            reason: Some(reason),
            ..self.success_response()
        }
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the resource document and its media type.
    pub fn with_resource(mut self, media_type: MediaType, resource: serde_json::Value) -> Self {
        self.media_type = Some(media_type);
        self.resource = Some(resource);
        self
    }

    /// Returns true if this command is a request (`status = pending`).
    pub fn is_request(&self) -> bool {
        self.status.is_pending()
    }

    /// Returns true if this command participates in request/response
    /// correlation as a response.
    ///
    /// Observe commands and commands without an id never correlate.
    pub fn is_correlatable_response(&self) -> bool {
        !self.status.is_pending()
            && self.method != CommandMethod::Observe
            && self.id.as_deref().is_some_and(|id| !id.is_empty())
    }
}
