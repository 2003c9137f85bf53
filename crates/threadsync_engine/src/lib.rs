//! # threadsync engine
//!
//! File synchronization engine for one thread's local mirror.
//!
//! This crate provides:
//! - Local state store (cursor, file records, operation journal, conflicts,
//!   idempotency ledger) with an on-disk and an in-memory implementation
//! - Transfer engine with resumable downloads, chunked uploads and retry
//! - Conflict detection, parking and resolution
//! - Manifest reconciler (pull, then push local edits)
//! - Change-feed listener that requests passes
//! - HTTP remote over a pluggable [`HttpClient`]
//!
//! ## Architecture
//!
//! A pass runs **pull-then-push**:
//! 1. Page through the manifest from the stored cursor
//! 2. Apply each item in order and persist its cursor
//! 3. Upload local edits and propagate local deletions
//!
//! ## Key Invariants
//!
//! - The stored cursor never passes an item that was not applied
//! - Re-running a completed pass transfers nothing
//! - Chunk, commit and delete calls are idempotent
//! - Conflicts are kept side by side, never merged or dropped
//! - One pass per thread at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod conflict;
mod credentials;
mod engine;
mod error;
mod feed;
mod file_store;
mod http;
mod memory;
mod model;
mod reconciler;
mod store;
mod transfer;
mod transport;
mod workspace;

pub use cancel::CancelToken;
pub use config::{
    FeedConfig, RetryPolicy, SyncConfig, DEFAULT_CHUNK_SIZE, DEFAULT_LEDGER_CAPACITY,
    DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_PAGE_LIMIT,
};
pub use conflict::{
    classify, conflict_file_name, ConflictResolver, LocalChange, RemoteChange, Verdict,
};
pub use credentials::{
    account_name, normalize_token, AuthTokens, CredentialProvider, EnvCredentials,
    StaticCredentials,
};
pub use engine::{EngineStatus, PassOutcome, SyncEngine, SyncScheduler, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use feed::{ChangeFeedListener, ListenerState, PassRequester, TriggerReason};
pub use file_store::FileStateStore;
pub use http::{
    error_for_status, ByteStream, HttpClient, HttpFailure, HttpMethod, HttpRemote, HttpRequest,
    HttpResponse, SseFeedStream, StreamingResponse,
};
pub use memory::{CallLog, Fault, FaultTarget, FeedScript, MemoryFeed, MemoryRemote};
pub use model::{
    ConflictRecord, FileRecord, IdempotencyEntry, IdempotentCall, LastError, OperationKind,
    OperationStatus, Resolution, SyncOperation,
};
pub use reconciler::{PassReport, Reconciler};
pub use store::{
    MemoryStateStore, StateStore, ThreadState, ThreadStateBackend, STATE_FORMAT_VERSION,
};
pub use transfer::{TransferEngine, TransferStats};
pub use transport::{
    CommitOutcome, DeleteOutcome, Download, DownloadBody, FeedSource, FeedStream, RemoteStore,
};
pub use workspace::{
    LocalFileState, LocalMetadata, LocalWorkspace, WorkspaceInfo, WorkspaceProvider, TEMP_SUFFIX,
};
