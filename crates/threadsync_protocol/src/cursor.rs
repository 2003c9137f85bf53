//! Opaque server-issued position tokens.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, server-issued manifest position.
///
/// Cursors are monotonic per thread, but the order is defined by the server.
/// The client only ever compares cursors for equality (stall detection) and
/// never interprets their contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Creates a cursor, rejecting empty or whitespace-only tokens.
    pub fn parse(token: impl Into<String>) -> ProtocolResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ProtocolError::invalid_field("cursor", "must not be empty"));
        }
        Ok(Self(token))
    }

    /// Returns the raw token as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the last change-feed event a client has seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an event id, rejecting empty tokens.
    pub fn parse(token: impl Into<String>) -> ProtocolResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ProtocolError::invalid_field("id", "must not be empty"));
        }
        Ok(Self(token))
    }

    /// Returns the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_rejects_blank_tokens() {
        assert!(SyncCursor::parse("").is_err());
        assert!(SyncCursor::parse("   ").is_err());
        assert_eq!(SyncCursor::parse("cursor-1").unwrap().as_str(), "cursor-1");
    }

    #[test]
    fn cursor_is_transparent_on_the_wire() {
        let cursor = SyncCursor::parse("c-42").unwrap();
        assert_eq!(serde_json::to_string(&cursor).unwrap(), "\"c-42\"");
    }

    #[test]
    fn event_id_display() {
        let id = EventId::parse("evt-7").unwrap();
        assert_eq!(id.to_string(), "evt-7");
    }
}
