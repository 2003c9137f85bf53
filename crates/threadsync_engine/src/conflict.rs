//! Conflict detection and resolution.
//!
//! A conflict is a local edit made since the last synced record while the
//! server reports a different revision for the same path. When one is found
//! the local copy is parked next to the original as
//! `name (conflict <device> <yyyy-mm-dd hhmmss>).ext`, an unresolved
//! [`ConflictRecord`] is stored, and the remote version takes the original
//! path. Nothing is merged and nothing is discarded until the user resolves.

use crate::cancel::CancelToken;
use crate::error::{SyncError, SyncResult};
use crate::model::{ConflictRecord, FileRecord, Resolution};
use crate::store::StateStore;
use crate::transfer::TransferEngine;
use crate::transport::{CommitOutcome, RemoteStore};
use crate::workspace::{LocalFileState, WorkspaceProvider};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use threadsync_protocol::RemoteFile;
use tracing::info;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// How the local file relates to its stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// No file at the path.
    Missing,
    /// Content matches the record.
    Unchanged,
    /// Content differs from the record.
    Modified(LocalFileState),
    /// A file exists but no record does.
    Untracked(LocalFileState),
}

impl LocalChange {
    fn sha256(&self) -> Option<&str> {
        match self {
            LocalChange::Modified(state) | LocalChange::Untracked(state) => {
                Some(state.sha256.as_str())
            }
            _ => None,
        }
    }
}

/// Remote side of a manifest item.
#[derive(Debug, Clone, Copy)]
pub enum RemoteChange<'a> {
    /// A live revision.
    Upsert(&'a RemoteFile),
    /// The path was deleted.
    Tombstone,
}

/// Decision for one manifest item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The record already reflects the remote revision; nothing to do.
    Current,
    /// Local content already equals the remote version; only the record
    /// needs refreshing.
    InSync,
    /// Apply the remote change locally.
    RemoteOnly,
    /// The remote side is unchanged; a local edit waits for the push phase.
    LocalOnly,
    /// Both sides changed.
    Conflict,
}

/// Decides what to do with a manifest item.
pub fn classify(record: Option<&FileRecord>, local: &LocalChange, remote: RemoteChange<'_>) -> Verdict {
    let remote_unchanged = match (record, remote) {
        (Some(record), RemoteChange::Upsert(file)) => {
            record.last_synced_revision_id == file.revision_id
        }
        _ => false,
    };

    match (local, remote) {
        (LocalChange::Unchanged, _) if remote_unchanged => Verdict::Current,
        (LocalChange::Modified(_) | LocalChange::Missing, _) if remote_unchanged => {
            Verdict::LocalOnly
        }
        (LocalChange::Unchanged | LocalChange::Missing, _) => Verdict::RemoteOnly,
        (LocalChange::Modified(_) | LocalChange::Untracked(_), RemoteChange::Upsert(file)) => {
            if local.sha256() == Some(file.sha256.as_str()) {
                Verdict::InSync
            } else {
                Verdict::Conflict
            }
        }
        (LocalChange::Modified(_), RemoteChange::Tombstone) => Verdict::Conflict,
        // Never synced, so the deletion did not see it.
        (LocalChange::Untracked(_), RemoteChange::Tombstone) => Verdict::LocalOnly,
    }
}

/// Name of the parked copy of `path`.
///
/// `attempt` 1 is the plain name; later attempts add a counter inside the
/// parentheses.
pub fn conflict_file_name(path: &str, device: &str, at: DateTime<Utc>, attempt: u32) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match file.rfind('.') {
        Some(i) if i > 0 => (&file[..i], &file[i..]),
        _ => (file, ""),
    };
    let stamp = at.format("%Y-%m-%d %H%M%S");
    let device = sanitize_device(device);
    if attempt <= 1 {
        format!("{dir}{stem} (conflict {device} {stamp}){ext}")
    } else {
        format!("{dir}{stem} (conflict {device} {stamp} {attempt}){ext}")
    }
}

fn sanitize_device(device: &str) -> String {
    let cleaned: String = device
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "device".to_string()
    } else {
        cleaned
    }
}

/// Detects, parks and resolves conflicts for one thread.
pub struct ConflictResolver<S: StateStore, W: WorkspaceProvider> {
    thread_id: String,
    device_id: String,
    store: Arc<S>,
    workspace: Arc<W>,
}

impl<S: StateStore, W: WorkspaceProvider> ConflictResolver<S, W> {
    /// Creates a resolver.
    pub fn new(
        thread_id: impl Into<String>,
        device_id: impl Into<String>,
        store: Arc<S>,
        workspace: Arc<W>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            device_id: device_id.into(),
            store,
            workspace,
        }
    }

    /// Compares the local file with its record.
    ///
    /// Size and mtime equal to the record count as unchanged without hashing.
    pub async fn local_change(&self, path: &str, record: Option<&FileRecord>) -> SyncResult<LocalChange> {
        let Some(meta) = self.workspace.metadata(&self.thread_id, path).await? else {
            return Ok(LocalChange::Missing);
        };
        if let Some(record) = record {
            if meta.size == record.size && meta.mtime_utc == record.mtime_utc {
                return Ok(LocalChange::Unchanged);
            }
        }
        let Some(state) = self.workspace.stat(&self.thread_id, path).await? else {
            return Ok(LocalChange::Missing);
        };
        Ok(match record {
            None => LocalChange::Untracked(state),
            Some(record) if record.sha256 == state.sha256 => LocalChange::Unchanged,
            Some(_) => LocalChange::Modified(state),
        })
    }

    /// Moves the local copy of `path` aside and records an unresolved
    /// conflict.
    pub async fn park(
        &self,
        path: &str,
        local_sha256: &str,
        record: Option<&FileRecord>,
        remote_revision: Option<String>,
    ) -> SyncResult<ConflictRecord> {
        let detected_at = Utc::now();
        let conflict_path = self.free_conflict_path(path, detected_at).await?;
        self.workspace
            .rename(&self.thread_id, path, &conflict_path)
            .await?;

        let conflict = ConflictRecord {
            path: path.to_string(),
            conflict_path,
            local_revision: record.map(|r| r.last_synced_revision_id.clone()),
            local_sha256: local_sha256.to_string(),
            remote_revision,
            detected_at,
            resolution: Resolution::Unresolved,
        };
        self.store.put_conflict(&self.thread_id, &conflict)?;
        info!(
            thread = %self.thread_id,
            path,
            conflict_path = %conflict.conflict_path,
            remote_revision = ?conflict.remote_revision,
            "conflict detected; local copy parked"
        );
        Ok(conflict)
    }

    async fn free_conflict_path(&self, path: &str, at: DateTime<Utc>) -> SyncResult<String> {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let candidate = conflict_file_name(path, &self.device_id, at, attempt);
            if self
                .workspace
                .metadata(&self.thread_id, &candidate)
                .await?
                .is_none()
            {
                return Ok(candidate);
            }
        }
        Err(SyncError::InvalidPath(format!(
            "no free conflict name for {path}"
        )))
    }

    /// Returns true if `path` is the parked copy of an unresolved conflict.
    pub fn is_parked_copy(&self, path: &str) -> SyncResult<bool> {
        Ok(self
            .store
            .list_conflicts(&self.thread_id)?
            .iter()
            .any(|c| c.resolution == Resolution::Unresolved && c.conflict_path == path))
    }

    /// Applies a user decision to an unresolved conflict.
    ///
    /// `target` names the parked copy, or the original path when exactly one
    /// copy is parked for it.
    pub async fn resolve<R: RemoteStore>(
        &self,
        target: &str,
        resolution: Resolution,
        transfer: &TransferEngine<R, S>,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        let conflict = self.find_unresolved(target)?;

        match resolution {
            Resolution::Unresolved => {
                return Err(SyncError::InvalidStateTransition {
                    from: "unresolved".into(),
                    to: "unresolved".into(),
                });
            }
            Resolution::PickLocal => self.restore_local(&conflict, transfer, cancel).await?,
            Resolution::PickRemote => {
                self.workspace
                    .delete_file(&self.thread_id, &conflict.conflict_path)
                    .await?;
            }
            // The parked copy stays and is uploaded as a new file.
            Resolution::KeepBoth => {}
        }

        self.store
            .remove_conflict(&self.thread_id, &conflict.conflict_path)?;
        info!(
            thread = %self.thread_id,
            path = %conflict.path,
            conflict_path = %conflict.conflict_path,
            ?resolution,
            "conflict resolved"
        );
        Ok(())
    }

    fn find_unresolved(&self, target: &str) -> SyncResult<ConflictRecord> {
        let unresolved: Vec<ConflictRecord> = self
            .store
            .list_conflicts(&self.thread_id)?
            .into_iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .collect();
        if let Some(conflict) = unresolved.iter().find(|c| c.conflict_path == target) {
            return Ok(conflict.clone());
        }

        let mut on_path: Vec<ConflictRecord> =
            unresolved.into_iter().filter(|c| c.path == target).collect();
        match on_path.len() {
            0 => Err(SyncError::ConflictNotFound(target.to_string())),
            1 => Ok(on_path.remove(0)),
            _ => Err(SyncError::AmbiguousConflict {
                path: target.to_string(),
                parked: on_path.into_iter().map(|c| c.conflict_path).collect(),
            }),
        }
    }

    async fn restore_local<R: RemoteStore>(
        &self,
        conflict: &ConflictRecord,
        transfer: &TransferEngine<R, S>,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        let path = conflict.path.as_str();
        let bytes = self
            .workspace
            .read_file(&self.thread_id, &conflict.conflict_path)
            .await?
            .ok_or_else(|| {
                SyncError::io(
                    conflict.conflict_path.clone(),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                )
            })?;
        let if_match = self
            .store
            .get_file_record(&self.thread_id, path)?
            .map(|r| r.last_synced_revision_id);

        let revision_id = match transfer
            .upload(path, &bytes, Utc::now(), if_match.as_deref(), cancel)
            .await?
        {
            CommitOutcome::Committed { revision_id } => revision_id,
            CommitOutcome::Conflict {
                current_revision_id,
            } => {
                return Err(SyncError::PreconditionFailed {
                    path: path.to_string(),
                    current_revision_id,
                })
            }
        };

        let state = self
            .workspace
            .write_file(&self.thread_id, path, &bytes)
            .await?;
        self.store.put_file_record(
            &self.thread_id,
            &FileRecord {
                path: path.to_string(),
                sha256: state.sha256,
                mtime_utc: state.mtime_utc,
                size: state.size,
                last_synced_revision_id: revision_id,
                pending_operation: None,
            },
        )?;
        self.workspace
            .delete_file(&self.thread_id, &conflict.conflict_path)
            .await
    }
}
