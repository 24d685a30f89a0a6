//! Identifier types for deskpilot.
//!
//! Machine and connection IDs are issued by the control plane and treated as
//! opaque strings. The only local validation is that they are non-empty, so
//! an ID can always be spliced into a URL path segment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier was empty or whitespace only.
    #[error("identifier must not be empty")]
    Empty,

    /// The identifier contains a character that cannot appear in a path segment.
    #[error("identifier contains invalid character {0:?}")]
    InvalidChar(char),
}

fn validate(s: &str) -> Result<(), IdError> {
    if s.trim().is_empty() {
        return Err(IdError::Empty);
    }
    if let Some(c) = s.chars().find(|c| matches!(c, '/' | '?' | '#') || c.is_whitespace()) {
        return Err(IdError::InvalidChar(c));
    }
    Ok(())
}

/// A machine identifier assigned by the control plane at creation.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineId(String);

impl MachineId {
    /// Parse a `MachineId`, rejecting empty or path-breaking values.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty or contains `/`, `?`, `#` or whitespace.
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MachineId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MachineId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MachineId> for String {
    fn from(id: MachineId) -> Self {
        id.0
    }
}

/// A connection identifier issued by the control plane for a remote machine.
///
/// Local machines have no connection identifier at all.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Parse a `ConnectionId`, rejecting empty or path-breaking values.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty or contains `/`, `?`, `#` or whitespace.
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_accepts_opaque_strings() {
        let id = MachineId::new("01JC8Y3Q8Z").unwrap();
        assert_eq!(id.as_str(), "01JC8Y3Q8Z");
        assert_eq!(id.to_string(), "01JC8Y3Q8Z");
        assert_eq!(format!("{id:?}"), "MachineId(01JC8Y3Q8Z)");
    }

    #[test]
    fn empty_ids_rejected() {
        assert_eq!(MachineId::new(""), Err(IdError::Empty));
        assert_eq!(ConnectionId::new("   "), Err(IdError::Empty));
    }

    #[test]
    fn path_breaking_ids_rejected() {
        assert_eq!(MachineId::new("a/b"), Err(IdError::InvalidChar('/')));
        assert_eq!(ConnectionId::new("a?b"), Err(IdError::InvalidChar('?')));
        assert_eq!("a b".parse::<MachineId>(), Err(IdError::InvalidChar(' ')));
    }

    #[test]
    fn serde_uses_plain_strings() {
        let id = ConnectionId::new("conn-1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"conn-1\"");

        let parsed: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);

        let bad: Result<MachineId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }
}
