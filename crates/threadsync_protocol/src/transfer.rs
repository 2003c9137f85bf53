//! Transfer request and response bodies.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Builds the idempotency key for one chunk of an upload.
///
/// The key is scoped to `(upload_id, chunk_index)` so a retransmitted chunk is
/// recognised by the server instead of being appended twice.
pub fn chunk_idempotency_key(upload_id: &str, chunk_index: u32) -> String {
    format!("{upload_id}:{chunk_index}")
}

/// `Range` request header value asking for everything from `offset` on.
pub fn range_header(offset: u64) -> String {
    format!("bytes={offset}-")
}

/// Where a download body sits within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Offset of the first body byte.
    pub start: u64,
    /// Total size of the file, when the server reported it.
    pub total: Option<u64>,
}

impl ContentRange {
    /// A body that starts at the beginning of the file.
    pub fn whole(total: Option<u64>) -> Self {
        Self { start: 0, total }
    }

    /// Parses a `Content-Range: bytes start-end/total` value.
    pub fn parse(value: &str) -> Option<Self> {
        let range = value.trim().strip_prefix("bytes ")?;
        let (span, total) = range.split_once('/')?;
        let (start, _end) = span.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { start, total })
    }

    /// Returns true once `received` bytes from the start of the file cover
    /// it completely. Without a known total the end of the body is the end
    /// of the file.
    pub fn is_complete(&self, received: u64) -> bool {
        self.total.map_or(true, |total| received >= total)
    }
}

/// One chunk of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpload {
    /// Upload session id.
    pub upload_id: String,
    /// Thread the file belongs to.
    pub thread_id: String,
    /// Thread-relative path.
    pub path: String,
    /// Zero-based chunk index.
    pub chunk_index: u32,
    /// Total number of chunks in the upload.
    pub total_chunks: u32,
    /// Hex SHA-256 of this chunk.
    pub chunk_sha256: String,
    /// Chunk bytes.
    pub bytes: Vec<u8>,
}

impl ChunkUpload {
    /// Returns the idempotency key for this chunk.
    pub fn idempotency_key(&self) -> String {
        chunk_idempotency_key(&self.upload_id, self.chunk_index)
    }
}

/// Server acknowledgement of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// Index of the acknowledged chunk.
    pub chunk_index: u32,
    /// True if the server had already stored this chunk.
    #[serde(default)]
    pub duplicate: bool,
}

impl ChunkAck {
    /// Parses an acknowledgement. An empty body acknowledges `expected_index`.
    pub fn parse(body: &[u8], expected_index: u32) -> ProtocolResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self {
                chunk_index: expected_index,
                duplicate: false,
            });
        }
        let ack: ChunkAck = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::malformed("chunk ack", e.to_string()))?;
        if ack.chunk_index != expected_index {
            return Err(ProtocolError::invalid_field(
                "chunkIndex",
                format!("expected {expected_index}, got {}", ack.chunk_index),
            ));
        }
        Ok(ack)
    }
}

/// Finalizes an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    /// Upload session id.
    pub upload_id: String,
    /// Thread the file belongs to.
    pub thread_id: String,
    /// Thread-relative path.
    pub path: String,
    /// Hex SHA-256 of the full content.
    pub final_sha256: String,
    /// Content size in bytes.
    pub size: u64,
    /// Local modification time.
    pub mtime_utc: DateTime<Utc>,
    /// Optimistic-concurrency precondition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match_revision_id: Option<String>,
}

impl CommitRequest {
    /// Returns the idempotency key for this commit.
    pub fn idempotency_key(&self) -> String {
        format!("{}:commit", self.upload_id)
    }
}

/// Successful commit result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    /// The new server revision.
    pub revision_id: String,
}

impl CommitResponse {
    /// Parses and validates a commit response.
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        let response: CommitResponse = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::malformed("commit response", e.to_string()))?;
        if response.revision_id.trim().is_empty() {
            return Err(ProtocolError::invalid_field("revisionId", "must not be empty"));
        }
        Ok(response)
    }
}

/// Deletes a path remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Thread the file belongs to.
    pub thread_id: String,
    /// Thread-relative path.
    pub path: String,
    /// Optimistic-concurrency precondition.
    pub if_match_revision_id: Option<String>,
    /// Idempotency key for the call.
    pub idempotency_key: String,
}

/// Delete result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    /// Revision id of the tombstone, when the server issues one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<String>,
}

impl DeleteResponse {
    /// Parses a delete response. An empty body is a bare success.
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| ProtocolError::malformed("delete response", e.to_string()))
    }
}
