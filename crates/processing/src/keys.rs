//! Pool keys used by the processing engine.
//!
//! - `cmd:<command>` and `cmd:namespace:<ns>` for commands
//! - `obj:<type>/<ns>/<name>` for changed objects
//! - `elem:<type>/<ns>/<name>:<phase>` for element runs

use std::fmt;

use drover_core::{ElementId, Error, ObjectId, Result};
use drover_pool::{COMMAND_PREFIX, OBJECT_PREFIX};

/// Prefix of element keys.
pub const ELEMENT_PREFIX: &str = "elem:";

/// Command maintaining the lock of a namespace.
pub const NAMESPACE_COMMAND: &str = "namespace";

/// A parsed pool key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Command(String),
    Namespace(String),
    Object(ObjectId),
    Element(ElementId),
}

impl Key {
    /// Parse a raw pool key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for unknown prefixes or malformed ids.
    pub fn parse(key: &str) -> Result<Self> {
        if let Some(command) = key.strip_prefix(COMMAND_PREFIX) {
            return Ok(match command.split_once(':') {
                Some((NAMESPACE_COMMAND, namespace)) => Self::Namespace(namespace.to_string()),
                _ => Self::Command(command.to_string()),
            });
        }
        if let Some(id) = key.strip_prefix(OBJECT_PREFIX) {
            return id
                .parse()
                .map(Self::Object)
                .map_err(|e| Error::invalid_key(key, e.to_string()));
        }
        if let Some(id) = key.strip_prefix(ELEMENT_PREFIX) {
            return id
                .parse()
                .map(Self::Element)
                .map_err(|e| Error::invalid_key(key, e.to_string()));
        }
        Err(Error::invalid_key(key, "unknown key prefix"))
    }

    /// The namespace the key refers to.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Command(_) => None,
            Self::Namespace(namespace) => Some(namespace),
            Self::Object(id) => Some(id.namespace()),
            Self::Element(id) => Some(id.namespace()),
        }
    }

    #[must_use]
    pub const fn element(&self) -> Option<&ElementId> {
        match self {
            Self::Element(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(command) => write!(f, "{COMMAND_PREFIX}{command}"),
            Self::Namespace(namespace) => {
                write!(f, "{COMMAND_PREFIX}{NAMESPACE_COMMAND}:{namespace}")
            }
            Self::Object(id) => write!(f, "{OBJECT_PREFIX}{id}"),
            Self::Element(id) => write!(f, "{ELEMENT_PREFIX}{id}"),
        }
    }
}

/// The `elem:` key of an element.
#[must_use]
pub fn element_key(id: &ElementId) -> String {
    format!("{ELEMENT_PREFIX}{id}")
}

/// The command (without `cmd:`) maintaining a namespace.
#[must_use]
pub fn namespace_command(namespace: &str) -> String {
    format!("{NAMESPACE_COMMAND}:{namespace}")
}
