//! Error types for the sync engine.

use std::time::Duration;
use thiserror::Error;
use threadsync_protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection-level failure (reset, refused, DNS, broken stream).
    #[error("network error: {0}")]
    Network(String),

    /// A request exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The server failed with a 5xx status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
        /// False when the error payload said the call must not be retried.
        retryable: bool,
    },

    /// The server asked the client to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Server-provided delay hint.
        retry_after: Option<Duration>,
    },

    /// The server rejected the request with a 4xx status.
    #[error("request rejected with {status} ({code}): {message}")]
    Client {
        /// HTTP status.
        status: u16,
        /// Error code from the payload.
        code: String,
        /// Server message.
        message: String,
    },

    /// Credentials were missing or refused.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Downloaded content did not hash to the value the manifest declared.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Affected path.
        path: String,
        /// Hash from the manifest.
        expected: String,
        /// Hash of the received bytes.
        actual: String,
    },

    /// An `ifMatchRevisionId` precondition was not met.
    #[error("precondition failed for {path} (server revision {current_revision_id:?})")]
    PreconditionFailed {
        /// Affected path.
        path: String,
        /// Revision the server currently holds.
        current_revision_id: Option<String>,
    },

    /// The server repeated a cursor or omitted one while reporting more pages.
    #[error("manifest cursor stalled at {cursor:?}")]
    CursorStall {
        /// The offending next cursor (None when it was missing).
        cursor: Option<String>,
    },

    /// The workspace refused access to a path.
    #[error("permission denied for {path}: {message}")]
    Permission {
        /// Affected path.
        path: String,
        /// OS message.
        message: String,
    },

    /// The local state store cannot be read or written.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The server sent something that does not validate.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A path was rejected before touching the filesystem.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Workspace I/O failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Affected path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No unresolved conflict is recorded for the path.
    #[error("no conflict recorded for {0}")]
    ConflictNotFound(String),

    /// Several parked copies exist for the path; one has to be named.
    #[error("{path} has {} parked copies; resolve one of: {}", parked.len(), parked.join(", "))]
    AmbiguousConflict {
        /// Original path.
        path: String,
        /// Parked copies awaiting a decision.
        parked: Vec<String>,
    },

    /// The change feed cannot resume from the requested event id.
    #[error("change feed gap; a full pass is required")]
    FeedGap,

    /// The pass was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Applying one manifest item failed.
    #[error("failed to apply {path}: {source}")]
    ItemFailed {
        /// The path whose item failed.
        path: String,
        /// Underlying error.
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Wraps `self` with the path of the item being applied.
    pub fn for_item(self, path: impl Into<String>) -> Self {
        match self {
            SyncError::ItemFailed { .. } | SyncError::Cancelled => self,
            other => SyncError::ItemFailed {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// Maps a workspace I/O error, separating permission failures.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            SyncError::Permission {
                path,
                message: source.to_string(),
            }
        } else {
            SyncError::Io { path, source }
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Server { retryable, .. } => *retryable,
            SyncError::Network(_)
            | SyncError::Timeout
            | SyncError::RateLimited { .. }
            | SyncError::ChecksumMismatch { .. } => true,
            SyncError::ItemFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for errors that need operator attention rather than
    /// another automatic pass.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::CursorStall { .. }
            | SyncError::Permission { .. }
            | SyncError::StoreUnavailable(_) => true,
            SyncError::ItemFailed { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Returns the server's delay hint for rate limiting.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            SyncError::ItemFailed { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Returns the path the error is about, when it names one.
    pub fn path(&self) -> Option<&str> {
        match self {
            SyncError::ItemFailed { path, .. }
            | SyncError::ChecksumMismatch { path, .. }
            | SyncError::PreconditionFailed { path, .. }
            | SyncError::Permission { path, .. }
            | SyncError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Network("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Server {
            status: 503,
            message: "unavailable".into(),
            retryable: true,
        }
        .is_retryable());
        assert!(!SyncError::Server {
            status: 501,
            message: "not implemented".into(),
            retryable: false,
        }
        .is_retryable());
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());
        assert!(SyncError::ChecksumMismatch {
            path: "a".into(),
            expected: "x".into(),
            actual: "y".into()
        }
        .is_retryable());

        assert!(!SyncError::Client {
            status: 400,
            code: "bad_request".into(),
            message: "nope".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::CursorStall { cursor: None }.is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::CursorStall {
            cursor: Some("c1".into())
        }
        .is_fatal());
        assert!(SyncError::StoreUnavailable("locked".into()).is_fatal());
        assert!(!SyncError::Timeout.is_fatal());
    }

    #[test]
    fn item_failure_keeps_path_and_class() {
        let err = SyncError::Timeout.for_item("docs/a.txt");
        assert_eq!(err.path(), Some("docs/a.txt"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("docs/a.txt"));

        // Not double wrapped.
        let again = err.for_item("other");
        assert_eq!(again.path(), Some("docs/a.txt"));
    }

    #[test]
    fn permission_denied_is_separated() {
        let err = SyncError::io(
            "a.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, SyncError::Permission { .. }));
        assert!(err.is_fatal());

        let err = SyncError::io("a.txt", std::io::Error::other("disk"));
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
