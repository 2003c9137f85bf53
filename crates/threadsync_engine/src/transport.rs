//! Remote store abstraction.
//!
//! [`RemoteStore`] is the seam between the engine and the server. The engine
//! only speaks typed protocol values through it; [`HttpRemote`](crate::HttpRemote)
//! maps them to HTTP and [`MemoryRemote`](crate::MemoryRemote) serves them
//! from memory in tests.

use crate::error::SyncResult;
use async_trait::async_trait;
use threadsync_protocol::{
    ChunkAck, ChunkUpload, CommitRequest, ContentRange, DeleteRequest, EventId, FeedMessage,
    ManifestPage, SyncCursor,
};

/// Body of a download, read piece by piece.
#[async_trait]
pub trait DownloadBody: Send {
    /// Returns the next piece, or `None` once the server finished the body.
    ///
    /// A body may end before the file does; the caller asks again from the
    /// new offset.
    async fn next_piece(&mut self) -> SyncResult<Option<Vec<u8>>>;
}

/// A download whose headers arrived.
pub struct Download {
    /// Position of the body within the file.
    pub range: ContentRange,
    /// The body.
    pub body: Box<dyn DownloadBody>,
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The upload became the current revision.
    Committed {
        /// New revision id.
        revision_id: String,
    },
    /// The `ifMatchRevisionId` precondition failed.
    Conflict {
        /// Revision the server holds.
        current_revision_id: Option<String>,
    },
}

/// Result of a remote delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The path is gone.
    Deleted {
        /// Tombstone revision, when issued.
        revision_id: Option<String>,
    },
    /// The `ifMatchRevisionId` precondition failed.
    Conflict {
        /// Revision the server holds.
        current_revision_id: Option<String>,
    },
}

/// Server operations used by a sync pass.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches one manifest page starting after `cursor`.
    async fn fetch_manifest(
        &self,
        thread_id: &str,
        cursor: Option<&SyncCursor>,
        limit: u32,
    ) -> SyncResult<ManifestPage>;

    /// Opens the content of `revision_id` (or the current revision) from
    /// byte `offset`. The server may ignore the offset and start at zero.
    async fn download(
        &self,
        thread_id: &str,
        path: &str,
        revision_id: Option<&str>,
        offset: u64,
    ) -> SyncResult<Download>;

    /// Uploads one chunk.
    async fn upload_chunk(&self, chunk: &ChunkUpload) -> SyncResult<ChunkAck>;

    /// Commits an upload.
    async fn commit(&self, request: &CommitRequest) -> SyncResult<CommitOutcome>;

    /// Deletes a path.
    async fn delete(&self, request: &DeleteRequest) -> SyncResult<DeleteOutcome>;
}

/// An open change-feed subscription.
#[async_trait]
pub trait FeedStream: Send {
    /// Returns the next message, or `None` once the server closed the stream.
    async fn next_message(&mut self) -> SyncResult<Option<FeedMessage>>;
}

/// Opens change-feed subscriptions.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Subscribes to a thread, resuming after `last_event_id`.
    ///
    /// Fails with [`SyncError::FeedGap`](crate::SyncError::FeedGap) when the
    /// server can no longer resume from that id.
    async fn subscribe(
        &self,
        thread_id: &str,
        last_event_id: Option<&EventId>,
    ) -> SyncResult<Box<dyn FeedStream>>;
}
