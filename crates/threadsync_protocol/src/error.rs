//! Protocol errors and the shared server error payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for protocol parsing.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The body was not valid JSON for the expected shape.
    #[error("malformed {what}: {message}")]
    Malformed {
        /// Which payload failed to parse.
        what: &'static str,
        /// Decoder message.
        message: String,
    },

    /// A field was present but held an unacceptable value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name as it appears on the wire.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A relative path failed validation.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why the path was rejected.
        reason: &'static str,
    },

    /// An event-stream frame named an event type outside the closed set.
    #[error("unknown event type `{0}`")]
    UnknownEvent(String),
}

impl ProtocolError {
    /// Creates a malformed-payload error.
    pub fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            message: message.into(),
        }
    }

    /// Creates an invalid-field error.
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// The standard error body returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the server considers the call safe to retry, when it says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Free-form structured details.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ErrorPayload {
    /// Creates a payload with empty details.
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: Some(retryable),
            details: serde_json::Value::Null,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Parses an error body. Returns `None` when the body is not an error payload.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// Server hint for how long to wait before retrying, in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.details.get("retryAfterMs").and_then(|v| v.as_u64())
    }

    /// The revision the server currently holds, reported with precondition failures.
    pub fn current_revision_id(&self) -> Option<String> {
        self.details
            .get("currentRevisionId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_defaults_missing_fields() {
        let payload = ErrorPayload::parse(br#"{"code":"bad_request","message":"nope"}"#).unwrap();
        assert_eq!(payload.code, "bad_request");
        assert_eq!(payload.retryable, None);
        assert!(payload.details.is_null());
    }

    #[test]
    fn payload_hints() {
        let payload = ErrorPayload::new("rate_limited", "slow down", true)
            .with_details(json!({"retryAfterMs": 1500, "currentRevisionId": "rev-9"}));
        assert_eq!(payload.retry_after_ms(), Some(1500));
        assert_eq!(payload.current_revision_id().as_deref(), Some("rev-9"));
    }

    #[test]
    fn non_payload_body() {
        assert!(ErrorPayload::parse(b"<html>502</html>").is_none());
    }
}
