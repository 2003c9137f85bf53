//! On-disk state store.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! └─ <thread_id>/
//!    ├─ LOCK            # Advisory lock, one process per thread
//!    ├─ state.json      # ThreadState
//!    └─ state.json.tmp  # Temporary file for atomic writes
//! ```
//!
//! A thread directory is opened on first use and stays locked for the life
//! of the store. Every mutation rewrites `state.json` with the
//! write-then-rename pattern and fsyncs the directory.

use crate::config::DEFAULT_LEDGER_CAPACITY;
use crate::error::{SyncError, SyncResult};
use crate::store::{ThreadState, ThreadStateBackend, STATE_FORMAT_VERSION};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use threadsync_protocol::validate_thread_id;
use tracing::debug;

const STATE_FILE: &str = "state.json";
const STATE_TEMP: &str = "state.json.tmp";
const LOCK_FILE: &str = "LOCK";

/// An opened, locked thread directory.
#[derive(Debug)]
struct ThreadDir {
    path: PathBuf,
    _lock_file: File,
    state: ThreadState,
}

impl ThreadDir {
    fn open(path: PathBuf) -> SyncResult<Self> {
        fs::create_dir_all(&path).map_err(|e| unavailable(&path, e))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(|e| unavailable(&path, e))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::StoreUnavailable(format!(
                "{} is locked by another process",
                path.display()
            )));
        }

        let state = Self::load(&path)?;
        debug!(path = %path.display(), files = state.files.len(), "opened thread state");

        Ok(Self {
            path,
            _lock_file: lock_file,
            state,
        })
    }

    fn load(path: &Path) -> SyncResult<ThreadState> {
        let state_path = path.join(STATE_FILE);
        let data = match fs::read(&state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ThreadState::new()),
            Err(e) => return Err(unavailable(&state_path, e)),
        };

        let mut state: ThreadState = serde_json::from_slice(&data).map_err(|e| {
            SyncError::StoreUnavailable(format!("{} is corrupt: {e}", state_path.display()))
        })?;
        if state.format_version > STATE_FORMAT_VERSION {
            return Err(SyncError::StoreUnavailable(format!(
                "{} has unsupported format version {}",
                state_path.display(),
                state.format_version
            )));
        }
        state.upgrade();
        Ok(state)
    }

    /// 1. Write to temporary file
    /// 2. Sync temporary file to disk
    /// 3. Rename over `state.json`
    /// 4. Fsync the directory
    fn save(&self, state: &ThreadState) -> SyncResult<()> {
        let temp_path = self.path.join(STATE_TEMP);
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::StoreUnavailable(format!("cannot encode state: {e}")))?;

        let mut file = File::create(&temp_path).map_err(|e| unavailable(&temp_path, e))?;
        file.write_all(&data)
            .and_then(|()| file.sync_all())
            .map_err(|e| unavailable(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, self.path.join(STATE_FILE))
            .map_err(|e| unavailable(&self.path, e))?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> SyncResult<()> {
        let dir = File::open(&self.path).map_err(|e| unavailable(&self.path, e))?;
        dir.sync_all().map_err(|e| unavailable(&self.path, e))
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SyncResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> SyncError {
    SyncError::StoreUnavailable(format!("{}: {err}", path.display()))
}

/// Store persisting one JSON document per thread under a root directory.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    capacity: usize,
    threads: Mutex<HashMap<String, ThreadDir>>,
}

impl FileStateStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| unavailable(&root, e))?;
        if !root.is_dir() {
            return Err(SyncError::StoreUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            capacity: DEFAULT_LEDGER_CAPACITY,
            threads: Mutex::new(HashMap::new()),
        })
    }

    /// Sets the idempotency ledger capacity.
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens (and locks) a thread directory ahead of first use.
    pub fn open_thread(&self, thread_id: &str) -> SyncResult<()> {
        self.with_dir(thread_id, |_| Ok(()))
    }

    fn with_dir<T>(
        &self,
        thread_id: &str,
        f: impl FnOnce(&mut ThreadDir) -> SyncResult<T>,
    ) -> SyncResult<T> {
        validate_thread_id(thread_id).map_err(|e| SyncError::InvalidPath(e.to_string()))?;

        let mut threads = self.threads.lock();
        if !threads.contains_key(thread_id) {
            let dir = ThreadDir::open(self.root.join(thread_id))?;
            threads.insert(thread_id.to_string(), dir);
        }
        match threads.get_mut(thread_id) {
            Some(dir) => f(dir),
            None => Err(SyncError::StoreUnavailable(format!(
                "thread {thread_id} failed to open"
            ))),
        }
    }
}

impl ThreadStateBackend for FileStateStore {
    fn ledger_capacity(&self) -> usize {
        self.capacity
    }

    fn read<T>(&self, thread_id: &str, f: impl FnOnce(&ThreadState) -> T) -> SyncResult<T> {
        self.with_dir(thread_id, |dir| Ok(f(&dir.state)))
    }

    fn mutate<T>(&self, thread_id: &str, f: impl FnOnce(&mut ThreadState) -> T) -> SyncResult<T> {
        self.with_dir(thread_id, |dir| {
            let mut next = dir.state.clone();
            let out = f(&mut next);
            next.format_version = STATE_FORMAT_VERSION;
            dir.save(&next)?;
            dir.state = next;
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictRecord, FileRecord, Resolution};
    use crate::store::StateStore;
    use chrono::Utc;
    use tempfile::tempdir;
    use threadsync_protocol::SyncCursor;

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStateStore::open(dir.path()).unwrap();
            store
                .set_cursor("t1", &SyncCursor::parse("c-7").unwrap())
                .unwrap();
            store
                .put_file_record(
                    "t1",
                    &FileRecord {
                        path: "a.txt".into(),
                        sha256: "a".repeat(64),
                        mtime_utc: Utc::now(),
                        size: 3,
                        last_synced_revision_id: "r1".into(),
                        pending_operation: None,
                    },
                )
                .unwrap();
        }

        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.get_cursor("t1").unwrap().unwrap().as_str(), "c-7");
        assert_eq!(store.list_file_records("t1").unwrap().len(), 1);
        assert!(!dir.path().join("t1").join(STATE_TEMP).exists());
    }

    #[test]
    fn second_store_cannot_lock_thread() {
        let dir = tempdir().unwrap();
        let first = FileStateStore::open(dir.path()).unwrap();
        first.open_thread("t1").unwrap();

        let second = FileStateStore::open(dir.path()).unwrap();
        assert!(matches!(
            second.get_cursor("t1"),
            Err(SyncError::StoreUnavailable(_))
        ));
        // Other threads are unaffected.
        assert!(second.get_cursor("t2").is_ok());
    }

    #[test]
    fn corrupt_state_is_refused() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("t1")).unwrap();
        fs::write(dir.path().join("t1").join(STATE_FILE), b"{not json").unwrap();

        let store = FileStateStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get_cursor("t1"),
            Err(SyncError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn older_state_is_upgraded_on_open() {
        let dir = tempdir().unwrap();
        let mut old = ThreadState {
            format_version: 1,
            ..ThreadState::default()
        };
        old.conflicts.insert(
            "a.md".into(),
            ConflictRecord {
                path: "a.md".into(),
                conflict_path: "a (conflict).md".into(),
                local_revision: None,
                local_sha256: "a".repeat(64),
                remote_revision: Some("r2".into()),
                detected_at: Utc::now(),
                resolution: Resolution::Unresolved,
            },
        );
        fs::create_dir_all(dir.path().join("t1")).unwrap();
        fs::write(
            dir.path().join("t1").join(STATE_FILE),
            serde_json::to_vec(&old).unwrap(),
        )
        .unwrap();

        let store = FileStateStore::open(dir.path()).unwrap();
        assert!(store.get_conflict("t1", "a.md").unwrap().is_none());
        assert_eq!(
            store.get_conflict("t1", "a (conflict).md").unwrap().unwrap().path,
            "a.md"
        );
    }

    #[test]
    fn rejects_unsafe_thread_ids() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get_cursor("../escape"),
            Err(SyncError::InvalidPath(_))
        ));
    }
}
