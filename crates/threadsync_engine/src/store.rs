//! Local state store.
//!
//! The store is the single writer of sync metadata: the per-thread cursor,
//! file records, the operation journal, conflict records, the idempotency
//! ledger and the last error. Every mutation is durable before it returns.
//!
//! Two implementations are provided:
//! - [`MemoryStateStore`] for tests and ephemeral use
//! - [`FileStateStore`](crate::FileStateStore) for on-disk persistence

use crate::error::{SyncError, SyncResult};
use crate::model::{ConflictRecord, FileRecord, IdempotencyEntry, LastError, SyncOperation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use threadsync_protocol::SyncCursor;

/// Current on-disk format version of [`ThreadState`].
pub const STATE_FORMAT_VERSION: u32 = 2;

/// Store interface used by the engine.
///
/// All methods are scoped to a thread; implementations keep threads
/// independent of each other.
pub trait StateStore: Send + Sync {
    /// Returns the last applied manifest cursor.
    fn get_cursor(&self, thread_id: &str) -> SyncResult<Option<SyncCursor>>;
    /// Persists the last applied manifest cursor.
    fn set_cursor(&self, thread_id: &str, cursor: &SyncCursor) -> SyncResult<()>;

    /// Returns the record for a path.
    fn get_file_record(&self, thread_id: &str, path: &str) -> SyncResult<Option<FileRecord>>;
    /// Inserts or replaces the record for `record.path`.
    fn put_file_record(&self, thread_id: &str, record: &FileRecord) -> SyncResult<()>;
    /// Removes the record for a path.
    fn remove_file_record(&self, thread_id: &str, path: &str) -> SyncResult<()>;
    /// Lists every record of the thread, ordered by path.
    fn list_file_records(&self, thread_id: &str) -> SyncResult<Vec<FileRecord>>;

    /// Remembers the outcome of an idempotent call.
    fn record_idempotency_outcome(&self, thread_id: &str, entry: IdempotencyEntry)
        -> SyncResult<()>;
    /// Looks up a remembered outcome.
    fn lookup_idempotency_outcome(
        &self,
        thread_id: &str,
        key: &str,
    ) -> SyncResult<Option<IdempotencyEntry>>;

    /// Journals an operation (one per path).
    fn put_operation(&self, thread_id: &str, operation: &SyncOperation) -> SyncResult<()>;
    /// Removes the journaled operation for a path.
    fn remove_operation(&self, thread_id: &str, path: &str) -> SyncResult<()>;
    /// Lists journaled operations.
    fn list_operations(&self, thread_id: &str) -> SyncResult<Vec<SyncOperation>>;

    /// Inserts or replaces a conflict record. Records are keyed by their
    /// parked copy, so one path can carry several.
    fn put_conflict(&self, thread_id: &str, conflict: &ConflictRecord) -> SyncResult<()>;
    /// Returns the conflict whose parked copy is `conflict_path`.
    fn get_conflict(&self, thread_id: &str, conflict_path: &str)
        -> SyncResult<Option<ConflictRecord>>;
    /// Clears the conflict whose parked copy is `conflict_path`.
    fn remove_conflict(&self, thread_id: &str, conflict_path: &str) -> SyncResult<()>;
    /// Lists conflict records.
    fn list_conflicts(&self, thread_id: &str) -> SyncResult<Vec<ConflictRecord>>;

    /// Replaces the last error.
    fn set_last_error(&self, thread_id: &str, error: Option<LastError>) -> SyncResult<()>;
    /// Returns the last error.
    fn last_error(&self, thread_id: &str) -> SyncResult<Option<LastError>>;
}

/// Everything the store knows about one thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadState {
    /// Format version.
    #[serde(default)]
    pub format_version: u32,
    /// Last applied manifest cursor.
    #[serde(default)]
    pub cursor: Option<SyncCursor>,
    /// File records by path.
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    /// Journaled operations by path.
    #[serde(default)]
    pub operations: BTreeMap<String, SyncOperation>,
    /// Conflict records by parked copy path.
    #[serde(default)]
    pub conflicts: BTreeMap<String, ConflictRecord>,
    /// Idempotency ledger, oldest first.
    #[serde(default)]
    pub idempotency: VecDeque<IdempotencyEntry>,
    /// Last pass error.
    #[serde(default)]
    pub last_error: Option<LastError>,
}

impl ThreadState {
    /// Creates an empty state at the current format version.
    pub fn new() -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            ..Self::default()
        }
    }

    /// Brings state written by an older version to the current format.
    pub fn upgrade(&mut self) {
        if self.format_version < 2 {
            // Version 1 keyed conflicts by original path.
            let conflicts = std::mem::take(&mut self.conflicts);
            self.conflicts = conflicts
                .into_values()
                .map(|c| (c.conflict_path.clone(), c))
                .collect();
        }
        self.format_version = STATE_FORMAT_VERSION;
    }

    /// Records an outcome, evicting the oldest entries beyond `capacity`.
    pub fn remember(&mut self, entry: IdempotencyEntry, capacity: usize) {
        if let Some(existing) = self.idempotency.iter_mut().find(|e| e.key == entry.key) {
            *existing = entry;
            return;
        }
        self.idempotency.push_back(entry);
        while self.idempotency.len() > capacity.max(1) {
            self.idempotency.pop_front();
        }
    }

    /// Looks up an outcome.
    pub fn recall(&self, key: &str) -> Option<&IdempotencyEntry> {
        self.idempotency.iter().find(|e| e.key == key)
    }
}

/// A backend that can read and atomically mutate per-thread state.
///
/// [`StateStore`] is implemented for every backend, so a backend only
/// decides where state lives and how a mutation is made durable.
pub trait ThreadStateBackend: Send + Sync {
    /// Maximum number of idempotency entries kept per thread.
    fn ledger_capacity(&self) -> usize;

    /// Runs `f` against the state of a thread.
    fn read<T>(&self, thread_id: &str, f: impl FnOnce(&ThreadState) -> T) -> SyncResult<T>;

    /// Runs `f` against a copy of the state and makes the result durable.
    /// If persisting fails the previous state is kept.
    fn mutate<T>(&self, thread_id: &str, f: impl FnOnce(&mut ThreadState) -> T) -> SyncResult<T>;
}

impl<B: ThreadStateBackend> StateStore for B {
    fn get_cursor(&self, thread_id: &str) -> SyncResult<Option<SyncCursor>> {
        self.read(thread_id, |s| s.cursor.clone())
    }

    fn set_cursor(&self, thread_id: &str, cursor: &SyncCursor) -> SyncResult<()> {
        self.mutate(thread_id, |s| s.cursor = Some(cursor.clone()))
    }

    fn get_file_record(&self, thread_id: &str, path: &str) -> SyncResult<Option<FileRecord>> {
        self.read(thread_id, |s| s.files.get(path).cloned())
    }

    fn put_file_record(&self, thread_id: &str, record: &FileRecord) -> SyncResult<()> {
        self.mutate(thread_id, |s| {
            s.files.insert(record.path.clone(), record.clone());
        })
    }

    fn remove_file_record(&self, thread_id: &str, path: &str) -> SyncResult<()> {
        self.mutate(thread_id, |s| {
            s.files.remove(path);
        })
    }

    fn list_file_records(&self, thread_id: &str) -> SyncResult<Vec<FileRecord>> {
        self.read(thread_id, |s| s.files.values().cloned().collect())
    }

    fn record_idempotency_outcome(
        &self,
        thread_id: &str,
        entry: IdempotencyEntry,
    ) -> SyncResult<()> {
        let capacity = self.ledger_capacity();
        self.mutate(thread_id, |s| s.remember(entry, capacity))
    }

    fn lookup_idempotency_outcome(
        &self,
        thread_id: &str,
        key: &str,
    ) -> SyncResult<Option<IdempotencyEntry>> {
        self.read(thread_id, |s| s.recall(key).cloned())
    }

    fn put_operation(&self, thread_id: &str, operation: &SyncOperation) -> SyncResult<()> {
        self.mutate(thread_id, |s| {
            s.operations
                .insert(operation.path.clone(), operation.clone());
        })
    }

    fn remove_operation(&self, thread_id: &str, path: &str) -> SyncResult<()> {
        self.mutate(thread_id, |s| {
            s.operations.remove(path);
        })
    }

    fn list_operations(&self, thread_id: &str) -> SyncResult<Vec<SyncOperation>> {
        self.read(thread_id, |s| s.operations.values().cloned().collect())
    }

    fn put_conflict(&self, thread_id: &str, conflict: &ConflictRecord) -> SyncResult<()> {
        self.mutate(thread_id, |s| {
            s.conflicts
                .insert(conflict.conflict_path.clone(), conflict.clone());
        })
    }

    fn get_conflict(
        &self,
        thread_id: &str,
        conflict_path: &str,
    ) -> SyncResult<Option<ConflictRecord>> {
        self.read(thread_id, |s| s.conflicts.get(conflict_path).cloned())
    }

    fn remove_conflict(&self, thread_id: &str, conflict_path: &str) -> SyncResult<()> {
        self.mutate(thread_id, |s| {
            s.conflicts.remove(conflict_path);
        })
    }

    fn list_conflicts(&self, thread_id: &str) -> SyncResult<Vec<ConflictRecord>> {
        self.read(thread_id, |s| s.conflicts.values().cloned().collect())
    }

    fn set_last_error(&self, thread_id: &str, error: Option<LastError>) -> SyncResult<()> {
        self.mutate(thread_id, |s| s.last_error = error)
    }

    fn last_error(&self, thread_id: &str) -> SyncResult<Option<LastError>> {
        self.read(thread_id, |s| s.last_error.clone())
    }
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryStateStore {
    threads: Mutex<HashMap<String, ThreadState>>,
    unavailable: AtomicBool,
    capacity: usize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_ledger_capacity(crate::config::DEFAULT_LEDGER_CAPACITY)
    }

    /// Creates an empty store with a custom ledger capacity.
    pub fn with_ledger_capacity(capacity: usize) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    /// Makes every call fail with [`SyncError::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns a copy of a thread's state.
    pub fn snapshot(&self, thread_id: &str) -> ThreadState {
        self.threads
            .lock()
            .get(thread_id)
            .cloned()
            .unwrap_or_else(ThreadState::new)
    }

    fn check(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::StoreUnavailable("store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStateBackend for MemoryStateStore {
    fn ledger_capacity(&self) -> usize {
        self.capacity
    }

    fn read<T>(&self, thread_id: &str, f: impl FnOnce(&ThreadState) -> T) -> SyncResult<T> {
        self.check()?;
        let threads = self.threads.lock();
        match threads.get(thread_id) {
            Some(state) => Ok(f(state)),
            None => Ok(f(&ThreadState::new())),
        }
    }

    fn mutate<T>(&self, thread_id: &str, f: impl FnOnce(&mut ThreadState) -> T) -> SyncResult<T> {
        self.check()?;
        let mut threads = self.threads.lock();
        let state = threads
            .entry(thread_id.to_string())
            .or_insert_with(ThreadState::new);
        Ok(f(state))
    }
}
