//! Session envelopes and the session state set.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::node::Node;
use super::Reason;

/// States of the session lifecycle.
///
/// ```text
/// new → negotiating → authenticating → established → finishing → finished
///                                                  ↘                    ↗
///                                                   failed ────────────
/// ```
///
/// `finished` and `failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// The session was created but negotiation has not started.
    #[default]
    New,
    /// Transport options (compression, encryption) are being negotiated.
    Negotiating,
    /// The authentication scheme exchange is in progress.
    Authenticating,
    /// The session is active; message, notification, and command traffic
    /// is allowed.
    Established,
    /// An orderly shutdown was requested.
    Finishing,
    /// The session ended normally. Terminal.
    Finished,
    /// The session ended with an error. Terminal.
    Failed,
}

impl SessionState {
    /// Returns true for the terminal states `finished` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Returns true when application traffic is allowed.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Authenticating => "authenticating",
            Self::Established => "established",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Transport compression options offered during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionCompression {
    /// No compression.
    None,
    /// GZip stream compression.
    Gzip,
}

/// Transport encryption options offered during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEncryption {
    /// Plain transport.
    None,
    /// TLS-wrapped transport.
    Tls,
}

/// An envelope driving the session lifecycle between two nodes.
///
/// The handshake layer above the channel core exchanges these through
/// `send_session`/`receive_session`; the channel derives its state from
/// the last session envelope sent or received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Correlation identifier of the session.
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

    /// The session state this envelope announces.
    pub state: SessionState,

    /// Compression options the server offers (`negotiating` only).
    #[serde(
        rename = "compressionOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compression_options: Option<Vec<SessionCompression>>,

    /// The compression selected by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<SessionCompression>,

    /// Encryption options the server offers (`negotiating` only).
    #[serde(
        rename = "encryptionOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encryption_options: Option<Vec<SessionEncryption>>,

    /// The encryption selected by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SessionEncryption>,

    /// Authentication scheme options the server offers.
    #[serde(
        rename = "schemeOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub scheme_options: Option<Vec<String>>,

    /// The authentication scheme selected by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    /// Authentication payload for the selected scheme; opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<serde_json::Value>,

    /// Failure cause, present when `state` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,

    /// Extension metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Session {
    /// Creates a session envelope announcing the given state.
    pub fn new(state: SessionState) -> Self {
        Self {
            id: None,
            from: None,
            pp: None,
            to: None,
            state,
            compression_options: None,
            compression: None,
            encryption_options: None,
            encryption: None,
            scheme_options: None,
            scheme: None,
            authentication: None,
            reason: None,
            metadata: None,
        }
    }

    /// Creates a `failed` session envelope carrying a reason.
    pub fn failure(reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(SessionState::Failed)
        }
    }

    /// Sets the session id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
