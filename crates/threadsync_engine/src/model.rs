//! Persistent records owned by the state store.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last synced state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Thread-relative path.
    pub path: String,
    /// Hex SHA-256 of the content last written or uploaded.
    pub sha256: String,
    /// Local modification time right after the last sync.
    pub mtime_utc: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// Server revision the local copy corresponds to.
    pub last_synced_revision_id: String,
    /// Id of the operation currently working on the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_operation: Option<String>,
}

/// Kind of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Remote to local.
    Download,
    /// Local to remote.
    Upload,
    /// Remote deletion.
    Delete,
}

/// Status of a journaled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// In flight.
    Running,
    /// Finished.
    Success,
    /// Failed; see `retryable`.
    Error,
}

/// A journaled transfer.
///
/// Transitions are `running → success`, `running → error`, and `error →
/// running` through [`SyncOperation::retry`] when the failure was retryable.
/// Nothing leaves `success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique id.
    pub id: String,
    /// Thread-relative path.
    pub path: String,
    /// Transfer kind.
    pub kind: OperationKind,
    /// Current status.
    pub status: OperationStatus,
    /// Number of retries so far.
    pub retry_count: u32,
    /// Whether the last error may be retried.
    #[serde(default)]
    pub retryable: bool,
    /// Last error message or other detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Upload session reused when an interrupted upload resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Hash of the content being transferred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    /// When the operation was first started.
    pub started_at: DateTime<Utc>,
}

impl SyncOperation {
    /// Starts a new operation.
    pub fn start(kind: OperationKind, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            kind,
            status: OperationStatus::Running,
            retry_count: 0,
            retryable: false,
            detail: None,
            upload_id: None,
            content_sha256: None,
            started_at: Utc::now(),
        }
    }

    /// Marks the operation finished.
    pub fn succeed(&mut self) -> SyncResult<()> {
        self.expect_running("success")?;
        self.status = OperationStatus::Success;
        self.detail = None;
        Ok(())
    }

    /// Marks the operation failed.
    pub fn fail(&mut self, error: &SyncError) -> SyncResult<()> {
        self.expect_running("error")?;
        self.status = OperationStatus::Error;
        self.retryable = error.is_retryable();
        self.detail = Some(error.to_string());
        Ok(())
    }

    /// Moves a retryable failure back to running.
    pub fn retry(&mut self) -> SyncResult<()> {
        if self.status != OperationStatus::Error || !self.retryable {
            return Err(self.invalid("running"));
        }
        self.status = OperationStatus::Running;
        self.retry_count += 1;
        Ok(())
    }

    /// Returns true if the operation can be picked up again.
    pub fn is_resumable(&self) -> bool {
        match self.status {
            OperationStatus::Running => true,
            OperationStatus::Error => self.retryable,
            OperationStatus::Success => false,
        }
    }

    /// Journals an operation left `running` by a crash as a retryable error.
    pub fn mark_interrupted(&mut self) {
        if self.status == OperationStatus::Running {
            self.status = OperationStatus::Error;
            self.retryable = true;
            self.detail = Some("interrupted".to_string());
        }
    }

    fn expect_running(&self, to: &str) -> SyncResult<()> {
        if self.status == OperationStatus::Running {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn invalid(&self, to: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: format!("{:?}", self.status),
            to: to.to_string(),
        }
    }
}

/// How a conflict was (or is to be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Waiting for the user.
    Unresolved,
    /// Re-upload the parked local copy under the original path.
    PickLocal,
    /// Discard the parked local copy.
    PickRemote,
    /// Keep the parked copy as a separate file.
    KeepBoth,
}

impl Resolution {
    /// Parses a resolution name as typed by a user.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().replace('-', "_").as_str() {
            "pick_local" | "local" => Some(Resolution::PickLocal),
            "pick_remote" | "remote" => Some(Resolution::PickRemote),
            "keep_both" | "both" => Some(Resolution::KeepBoth),
            _ => None,
        }
    }
}

/// A detected conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Original path, which now holds the remote version (if any).
    pub path: String,
    /// Where the local copy was parked.
    pub conflict_path: String,
    /// Revision the local edit was based on (None for a never-synced file).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_revision: Option<String>,
    /// Hash of the parked local copy.
    pub local_sha256: String,
    /// Remote revision at detection (None when the remote side deleted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_revision: Option<String>,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
    /// Current resolution.
    pub resolution: Resolution,
}

/// Calls whose outcome the idempotency ledger remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotentCall {
    /// A chunk upload.
    Chunk,
    /// An upload commit.
    Commit,
    /// A remote delete.
    Delete,
}

/// Stored outcome of an idempotent call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyEntry {
    /// Idempotency key.
    pub key: String,
    /// Call kind.
    pub operation_kind: IdempotentCall,
    /// Revision produced by the call, when it produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_revision_id: Option<String>,
}

impl IdempotencyEntry {
    /// Creates an entry.
    pub fn new(
        key: impl Into<String>,
        operation_kind: IdempotentCall,
        outcome_revision_id: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            operation_kind,
            outcome_revision_id,
        }
    }
}

/// Error retained for display and manual retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Display message.
    pub message: String,
    /// Failing path, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Whether a later pass may succeed without intervention.
    #[serde(default)]
    pub retryable: bool,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    /// Captures an error.
    pub fn from_error(error: &SyncError) -> Self {
        Self {
            message: error.to_string(),
            path: error.path().map(str::to_string),
            retryable: error.is_retryable(),
            occurred_at: Utc::now(),
        }
    }
}
