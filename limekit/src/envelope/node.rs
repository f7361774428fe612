//! Routable protocol identities.
//!
//! A node address has the form `name@domain/instance`, where the instance
//! part is optional. Addresses appear in the `from`, `to`, and `pp` fields
//! of every envelope and are serialized as plain JSON strings.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A routable protocol identity (`name@domain/instance`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    /// Account name part (before the `@`).
    pub name: String,
    /// Domain part (after the `@`).
    pub domain: String,
    /// Optional instance part (after the `/`).
    pub instance: Option<String>,
}

/// Errors from parsing a node address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeParseError {
    /// The address is empty.
    #[error("node address is empty")]
    Empty,

    /// The address has no `@` separator or an empty name/domain part.
    #[error("malformed node address: {0:?}")]
    Malformed(String),
}

impl Node {
    /// Creates a node without an instance part.
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            instance: None,
        }
    }

    /// Creates a node with an instance part.
    pub fn with_instance(
        name: impl Into<String>,
        domain: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            instance: Some(instance.into()),
        }
    }

    /// Returns a copy of this node with the instance part removed.
    pub fn to_identity(&self) -> Node {
        Node {
            name: self.name.clone(),
            domain: self.domain.clone(),
            instance: None,
        }
    }

    /// Compares two nodes ignoring the instance part.
    ///
    /// Routing treats `alice@example.org` and `alice@example.org/home` as
    /// the same identity.
    pub fn is_same_identity(&self, other: &Node) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.domain)?;
        if let Some(instance) = &self.instance {
            write!(f, "/{instance}")?;
        }
        Ok(())
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeParseError::Empty);
        }

        let (name, rest) = s
            .split_once('@')
            .ok_or_else(|| NodeParseError::Malformed(s.to_string()))?;

        let (domain, instance) = match rest.split_once('/') {
            Some((domain, instance)) if !instance.is_empty() => {
                (domain, Some(instance.to_string()))
            }
            Some((domain, _)) => (domain, None),
            None => (rest, None),
        };

        if name.is_empty() || domain.is_empty() {
            return Err(NodeParseError::Malformed(s.to_string()));
        }

        Ok(Node {
            name: name.to_string(),
            domain: domain.to_string(),
            instance,
        })
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
