//! Manifest pages.
//!
//! The server lists the current state of a thread as a sequence of pages.
//! Each item carries its own cursor, which is finer-grained than the page
//! cursor and is what the client persists after applying the item.

use crate::cursor::SyncCursor;
use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::is_sha256_hex;
use crate::path::validate_relative_path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A manifest item exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    /// Thread-relative path.
    pub path: String,
    /// Whether the path has been deleted.
    #[serde(default)]
    pub tombstone: bool,
    /// Item-level cursor.
    pub cursor: String,
    /// Server revision of the file (absent for tombstones).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<String>,
    /// Content hash (absent for tombstones).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Content size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time recorded at commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_utc: Option<DateTime<Utc>>,
}

/// A manifest page exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawManifestPage {
    /// Items in server order.
    #[serde(default)]
    pub items: Vec<ManifestItem>,
    /// Cursor to request the next page with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether more pages follow.
    pub has_more: bool,
    /// Server clock at the time the page was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_utc: Option<DateTime<Utc>>,
}

/// The remote version of a file as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Server revision id.
    pub revision_id: String,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
    /// Declared size, when known.
    pub size: Option<u64>,
    /// Declared modification time, when known.
    pub mtime_utc: Option<DateTime<Utc>>,
}

/// A validated manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    /// The path exists remotely at the given version.
    Upsert {
        /// Thread-relative path.
        path: String,
        /// Item cursor.
        cursor: SyncCursor,
        /// Remote version.
        remote: RemoteFile,
    },
    /// The path was deleted remotely.
    Tombstone {
        /// Thread-relative path.
        path: String,
        /// Item cursor.
        cursor: SyncCursor,
    },
}

impl ManifestEntry {
    /// Creates an upsert entry.
    pub fn upsert(path: impl Into<String>, cursor: SyncCursor, remote: RemoteFile) -> Self {
        Self::Upsert {
            path: path.into(),
            cursor,
            remote,
        }
    }

    /// Creates a tombstone entry.
    pub fn tombstone(path: impl Into<String>, cursor: SyncCursor) -> Self {
        Self::Tombstone {
            path: path.into(),
            cursor,
        }
    }

    /// Returns the path.
    pub fn path(&self) -> &str {
        match self {
            ManifestEntry::Upsert { path, .. } | ManifestEntry::Tombstone { path, .. } => path,
        }
    }

    /// Returns the item cursor.
    pub fn cursor(&self) -> &SyncCursor {
        match self {
            ManifestEntry::Upsert { cursor, .. } | ManifestEntry::Tombstone { cursor, .. } => {
                cursor
            }
        }
    }

    /// Returns true for tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, ManifestEntry::Tombstone { .. })
    }

    /// Validates a wire item.
    pub fn from_item(item: ManifestItem) -> ProtocolResult<Self> {
        validate_relative_path(&item.path)?;
        let cursor = SyncCursor::parse(item.cursor)?;

        if item.tombstone {
            return Ok(Self::Tombstone {
                path: item.path,
                cursor,
            });
        }

        let revision_id = item
            .revision_id
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ProtocolError::invalid_field("revisionId", "required for live items"))?;
        let sha256 = item
            .sha256
            .ok_or_else(|| ProtocolError::invalid_field("sha256", "required for live items"))?
            .to_ascii_lowercase();
        if !is_sha256_hex(&sha256) {
            return Err(ProtocolError::invalid_field(
                "sha256",
                "expected 64 hex characters",
            ));
        }

        Ok(Self::Upsert {
            path: item.path,
            cursor,
            remote: RemoteFile {
                revision_id,
                sha256,
                size: item.size,
                mtime_utc: item.mtime_utc,
            },
        })
    }
}

/// A validated manifest page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPage {
    /// Entries in server order.
    pub entries: Vec<ManifestEntry>,
    /// Cursor for the next page.
    pub next_cursor: Option<SyncCursor>,
    /// Whether more pages follow.
    pub has_more: bool,
    /// Server clock, when reported.
    pub server_time_utc: Option<DateTime<Utc>>,
}

impl ManifestPage {
    /// Creates a page.
    pub fn new(entries: Vec<ManifestEntry>, next_cursor: Option<SyncCursor>, has_more: bool) -> Self {
        Self {
            entries,
            next_cursor,
            has_more,
            server_time_utc: None,
        }
    }

    /// Parses and validates a JSON page body.
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        let raw: RawManifestPage = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::malformed("manifest page", e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Validates a decoded wire page.
    ///
    /// A missing `nextCursor` on a `hasMore` page is not rejected here; the
    /// reconciler reports it as a cursor stall so the pass fails with the
    /// right error class.
    pub fn from_raw(raw: RawManifestPage) -> ProtocolResult<Self> {
        let entries = raw
            .items
            .into_iter()
            .map(ManifestEntry::from_item)
            .collect::<ProtocolResult<Vec<_>>>()?;

        let next_cursor = match raw.next_cursor {
            Some(token) if !token.trim().is_empty() => Some(SyncCursor::parse(token)?),
            _ => None,
        };

        Ok(Self {
            entries,
            next_cursor,
            has_more: raw.has_more,
            server_time_utc: raw.server_time_utc,
        })
    }

    /// Converts back to the wire shape.
    pub fn to_raw(&self) -> RawManifestPage {
        let items = self
            .entries
            .iter()
            .map(|entry| match entry {
                ManifestEntry::Upsert {
                    path,
                    cursor,
                    remote,
                } => ManifestItem {
                    path: path.clone(),
                    tombstone: false,
                    cursor: cursor.as_str().to_string(),
                    revision_id: Some(remote.revision_id.clone()),
                    sha256: Some(remote.sha256.clone()),
                    size: remote.size,
                    mtime_utc: remote.mtime_utc,
                },
                ManifestEntry::Tombstone { path, cursor } => ManifestItem {
                    path: path.clone(),
                    tombstone: true,
                    cursor: cursor.as_str().to_string(),
                    revision_id: None,
                    sha256: None,
                    size: None,
                    mtime_utc: None,
                },
            })
            .collect();

        RawManifestPage {
            items,
            next_cursor: self.next_cursor.as_ref().map(|c| c.as_str().to_string()),
            has_more: self.has_more,
            server_time_utc: self.server_time_utc,
        }
    }

    /// Returns the cursor of the last entry, if any.
    pub fn terminal_cursor(&self) -> Option<&SyncCursor> {
        self.entries.last().map(ManifestEntry::cursor)
    }
}
