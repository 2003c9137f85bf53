//! Local workspace access.
//!
//! The engine never touches the filesystem directly; it goes through a
//! [`WorkspaceProvider`], which validates every thread-relative path before
//! resolving it under the thread directory.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use threadsync_protocol::{sha256_hex, validate_relative_path, validate_thread_id};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Suffix of in-progress writes; such files are never listed.
pub const TEMP_SUFFIX: &str = ".threadsync-tmp";

/// Result of preparing a thread workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceInfo {
    /// Workspace root.
    pub root_path: PathBuf,
    /// Directory holding the thread's files.
    pub thread_path: PathBuf,
    /// True if the thread directory was created by this call.
    pub created: bool,
}

/// Cheap metadata of a local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub mtime_utc: DateTime<Utc>,
}

/// Hashed state of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileState {
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub mtime_utc: DateTime<Utc>,
}

/// Filesystem operations the engine needs.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Creates the thread directory if needed.
    async fn ensure_workspace(&self, thread_id: &str) -> SyncResult<WorkspaceInfo>;

    /// Atomically replaces a file, creating parent directories.
    async fn write_file(
        &self,
        thread_id: &str,
        relative_path: &str,
        bytes: &[u8],
    ) -> SyncResult<LocalFileState>;

    /// Deletes a file. Deleting a missing file succeeds.
    async fn delete_file(&self, thread_id: &str, relative_path: &str) -> SyncResult<()>;

    /// Reads a file, `None` if it does not exist.
    async fn read_file(&self, thread_id: &str, relative_path: &str)
        -> SyncResult<Option<Vec<u8>>>;

    /// Returns size and mtime without reading the content.
    async fn metadata(
        &self,
        thread_id: &str,
        relative_path: &str,
    ) -> SyncResult<Option<LocalMetadata>>;

    /// Reads and hashes a file.
    async fn stat(&self, thread_id: &str, relative_path: &str)
        -> SyncResult<Option<LocalFileState>>;

    /// Renames a file within the thread.
    async fn rename(&self, thread_id: &str, from: &str, to: &str) -> SyncResult<()>;

    /// Lists every file of the thread as relative paths, sorted.
    async fn list_files(&self, thread_id: &str) -> SyncResult<Vec<String>>;
}

/// [`WorkspaceProvider`] backed by a directory tree on `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    /// Creates a workspace rooted at `root`. Each thread gets `root/<thread_id>`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread_id: &str) -> SyncResult<PathBuf> {
        validate_thread_id(thread_id).map_err(|e| SyncError::InvalidPath(e.to_string()))?;
        Ok(self.root.join(thread_id))
    }

    fn resolve(&self, thread_id: &str, relative_path: &str) -> SyncResult<PathBuf> {
        validate_relative_path(relative_path).map_err(|e| SyncError::InvalidPath(e.to_string()))?;
        let mut path = self.thread_dir(thread_id)?;
        for segment in relative_path.split('/') {
            path.push(segment);
        }
        Ok(path)
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(format!(".{}", name.to_string_lossy()))
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspace {
    async fn ensure_workspace(&self, thread_id: &str) -> SyncResult<WorkspaceInfo> {
        let thread_path = self.thread_dir(thread_id)?;
        let existed = fs::try_exists(&thread_path)
            .await
            .map_err(|e| SyncError::io(thread_id, e))?;
        fs::create_dir_all(&thread_path)
            .await
            .map_err(|e| SyncError::io(thread_id, e))?;
        Ok(WorkspaceInfo {
            root_path: self.root.clone(),
            thread_path,
            created: !existed,
        })
    }

    async fn write_file(
        &self,
        thread_id: &str,
        relative_path: &str,
        bytes: &[u8],
    ) -> SyncResult<LocalFileState> {
        let path = self.resolve(thread_id, relative_path)?;
        let io = |e| SyncError::io(relative_path, e);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io)?;
        }

        let temp = temp_path_for(&path);
        let mut file = fs::File::create(&temp).await.map_err(io)?;
        file.write_all(bytes).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        drop(file);
        fs::rename(&temp, &path).await.map_err(io)?;

        let meta = fs::metadata(&path).await.map_err(io)?;
        Ok(LocalFileState {
            sha256: sha256_hex(bytes),
            size: meta.len(),
            mtime_utc: mtime_of(&meta),
        })
    }

    async fn delete_file(&self, thread_id: &str, relative_path: &str) -> SyncResult<()> {
        let path = self.resolve(thread_id, relative_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(relative_path, e)),
        }
    }

    async fn read_file(
        &self,
        thread_id: &str,
        relative_path: &str,
    ) -> SyncResult<Option<Vec<u8>>> {
        let path = self.resolve(thread_id, relative_path)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(relative_path, e)),
        }
    }

    async fn metadata(
        &self,
        thread_id: &str,
        relative_path: &str,
    ) -> SyncResult<Option<LocalMetadata>> {
        let path = self.resolve(thread_id, relative_path)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(LocalMetadata {
                size: meta.len(),
                mtime_utc: mtime_of(&meta),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(relative_path, e)),
        }
    }

    async fn stat(
        &self,
        thread_id: &str,
        relative_path: &str,
    ) -> SyncResult<Option<LocalFileState>> {
        let Some(meta) = self.metadata(thread_id, relative_path).await? else {
            return Ok(None);
        };
        let Some(bytes) = self.read_file(thread_id, relative_path).await? else {
            return Ok(None);
        };
        Ok(Some(LocalFileState {
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            mtime_utc: meta.mtime_utc,
        }))
    }

    async fn rename(&self, thread_id: &str, from: &str, to: &str) -> SyncResult<()> {
        let source = self.resolve(thread_id, from)?;
        let target = self.resolve(thread_id, to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(to, e))?;
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| SyncError::io(from, e))
    }

    async fn list_files(&self, thread_id: &str) -> SyncResult<Vec<String>> {
        let base = self.thread_dir(thread_id)?;
        let mut files = Vec::new();
        let mut pending = vec![(base, String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::io(prefix.clone(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SyncError::io(prefix.clone(), e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                let relative = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let kind = entry
                    .file_type()
                    .await
                    .map_err(|e| SyncError::io(relative.clone(), e))?;
                if kind.is_dir() {
                    pending.push((entry.path(), relative));
                } else if kind.is_file() && validate_relative_path(&relative).is_ok() {
                    files.push(relative);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
