//! # threadsync Protocol
//!
//! Wire types and validation for the threadsync file sync protocol.
//!
//! This crate provides:
//! - [`SyncCursor`] and [`EventId`] opaque server tokens
//! - Manifest pages parsed into closed [`ManifestEntry`] variants
//! - Chunk, commit and delete request/response bodies
//! - The shared [`ErrorPayload`] shape
//! - Change feed events and a `text/event-stream` frame decoder
//! - SHA-256 content hashing and relative path validation
//!
//! This is a pure protocol crate with no I/O operations. Every payload that
//! arrives from the server goes through an explicit `parse` step that either
//! yields a typed value or a [`ProtocolError`]; nothing downstream inspects
//! raw JSON.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod cursor;
mod error;
mod hash;
mod manifest;
mod path;
mod transfer;

pub use change_feed::{FeedEvent, FeedEventKind, FeedMessage, SseDecoder, SseFrame};
pub use cursor::{EventId, SyncCursor};
pub use error::{ErrorPayload, ProtocolError, ProtocolResult};
pub use hash::{is_sha256_hex, sha256_hex, Sha256Hasher};
pub use manifest::{ManifestEntry, ManifestItem, ManifestPage, RawManifestPage, RemoteFile};
pub use path::{validate_relative_path, validate_thread_id};
pub use transfer::{
    chunk_idempotency_key, range_header, ChunkAck, ChunkUpload, CommitRequest, CommitResponse,
    ContentRange, DeleteRequest, DeleteResponse,
};

/// Protocol version sent with every request.
pub const PROTOCOL_VERSION: u16 = 1;
