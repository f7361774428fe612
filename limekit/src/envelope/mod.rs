//! Protocol envelopes.
//!
//! Every unit on the wire is one of four envelope kinds, serialized as a
//! single JSON object whose discriminator is the presence of kind-specific
//! fields:
//!
//! | kind | discriminator |
//! |------|---------------|
//! | [`Message`] | `content` / `type` |
//! | [`Notification`] | `event` |
//! | [`Command`] | `method` |
//! | [`Session`] | `state` |
//!
//! The `id`, `from`, `pp`, `to`, and `metadata` fields are shared by all
//! kinds.

mod command;
mod document;
mod message;
mod node;
mod notification;
mod session;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use command::{Command, CommandMethod, CommandStatus};
pub use document::{ping_document, MediaType, PING_MEDIA_TYPE, TEXT_MEDIA_TYPE};
pub use message::Message;
pub use node::{Node, NodeParseError};
pub use notification::{Notification, NotificationEvent};
pub use session::{Session, SessionCompression, SessionEncryption, SessionState};

/// Reason code for a session closed because the remote peer went idle.
pub const REASON_CODE_SESSION_IDLE: i32 = 53;

/// Reason code for a generic routing failure.
pub const REASON_CODE_ROUTING_ERROR: i32 = 40;

/// A coded explanation attached to failure envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Numeric reason code.
    pub code: i32,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reason {
    /// Creates a reason with a code and description.
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{description} (code {})", self.code),
            None => write!(f, "code {}", self.code),
        }
    }
}

/// The envelope kind, used for demultiplexing and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// A [`Message`] envelope.
    Message,
    /// A [`Notification`] envelope.
    Notification,
    /// A [`Command`] envelope.
    Command,
    /// A [`Session`] envelope.
    Session,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Message => "message",
            Self::Notification => "notification",
            Self::Command => "command",
            Self::Session => "session",
        };
        f.write_str(name)
    }
}

/// Any protocol envelope.
///
/// Deserialization resolves the kind by field presence, trying the kinds
/// with unambiguous required fields first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// A session lifecycle envelope (`state`).
    Session(Session),
    /// A delivery feedback envelope (`event`).
    Notification(Notification),
    /// A request/response envelope (`method`).
    Command(Command),
    /// A content envelope (`type` + `content`).
    Message(Message),
}

impl Envelope {
    /// Returns the kind of this envelope.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Message(_) => EnvelopeKind::Message,
            Self::Notification(_) => EnvelopeKind::Notification,
            Self::Command(_) => EnvelopeKind::Command,
            Self::Session(_) => EnvelopeKind::Session,
        }
    }

    /// Returns the correlation id, if present.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message(e) => e.id.as_deref(),
            Self::Notification(e) => e.id.as_deref(),
            Self::Command(e) => e.id.as_deref(),
            Self::Session(e) => e.id.as_deref(),
        }
    }

    /// Returns the sender address, if present.
    pub fn from(&self) -> Option<&Node> {
        match self {
            Self::Message(e) => e.from.as_ref(),
            Self::Notification(e) => e.from.as_ref(),
            Self::Command(e) => e.from.as_ref(),
            Self::Session(e) => e.from.as_ref(),
        }
    }

    /// Returns the destination address, if present.
    pub fn to(&self) -> Option<&Node> {
        match self {
            Self::Message(e) => e.to.as_ref(),
            Self::Notification(e) => e.to.as_ref(),
            Self::Command(e) => e.to.as_ref(),
            Self::Session(e) => e.to.as_ref(),
        }
    }

    /// Replaces the sender address.
    pub fn set_from(&mut self, from: Option<Node>) {
        match self {
            Self::Message(e) => e.from = from,
            Self::Notification(e) => e.from = from,
            Self::Command(e) => e.from = from,
            Self::Session(e) => e.from = from,
        }
    }

    /// Replaces the destination address.
    pub fn set_to(&mut self, to: Option<Node>) {
        match self {
            Self::Message(e) => e.to = to,
            Self::Notification(e) => e.to = to,
            Self::Command(e) => e.to = to,
            Self::Session(e) => e.to = to,
        }
    }

    /// Returns the extension metadata, if present.
    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Message(e) => e.metadata.as_ref(),
            Self::Notification(e) => e.metadata.as_ref(),
            Self::Command(e) => e.metadata.as_ref(),
            Self::Session(e) => e.metadata.as_ref(),
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Notification> for Envelope {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Session> for Envelope {
    fn from(session: Session) -> Self {
        Self::Session(session)
    }
}
