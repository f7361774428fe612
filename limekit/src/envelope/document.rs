//! Typed document payloads.
//!
//! The channel core treats document bodies opaquely: a document is a media
//! type plus a JSON value. Media types ending in `+json` (and
//! `application/json` itself) carry structured JSON bodies; any other type
//! carries its textual representation as a JSON string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Media type of the ping document used by the auto-reply module and the
/// remote-ping watchdog.
pub const PING_MEDIA_TYPE: &str = "application/vnd.lime.ping+json";

/// Media type for plain text documents.
pub const TEXT_MEDIA_TYPE: &str = "text/plain";

/// A MIME media type such as `application/vnd.lime.ping+json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaType(String);

impl MediaType {
    /// Creates a media type from its textual form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The `text/plain` media type.
    pub fn text_plain() -> Self {
        Self::new(TEXT_MEDIA_TYPE)
    }

    /// The ping document media type.
    pub fn ping() -> Self {
        Self::new(PING_MEDIA_TYPE)
    }

    /// Returns the textual form of the media type.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the body of this type is structured JSON.
    ///
    /// Structured types are `application/json` and any type whose subtype
    /// carries a `+json` suffix.
    pub fn is_json(&self) -> bool {
        let base = self.0.split(';').next().unwrap_or("").trim();
        base.eq_ignore_ascii_case("application/json")
            || base
                .rsplit_once('+')
                .is_some_and(|(_, suffix)| suffix.eq_ignore_ascii_case("json"))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Returns the body of a ping document.
///
/// The ping document has no fields; it serializes as `{}`.
pub fn ping_document() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
