//! Test fixtures and harness helpers.
//!
//! Provides a [`TestHarness`] that wires a [`SyncEngine`] to an in-memory
//! remote, an on-disk state store and a temporary workspace, plus helpers
//! for inspecting the mirror.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use threadsync_engine::{
    FileRecord, FileStateStore, LocalWorkspace, MemoryRemote, RetryPolicy, StateStore,
    SyncConfig, SyncEngine, ThreadState, ThreadStateBackend, TEMP_SUFFIX,
};

/// Thread mirrored by every harness.
pub const TEST_THREAD: &str = "thread-1";

/// Device name used for conflict copies.
pub const TEST_DEVICE: &str = "test-device";

/// Engine type built by [`TestHarness`].
pub type TestEngine = SyncEngine<MemoryRemote, FileStateStore, LocalWorkspace>;

static MTIME_BUMP: AtomicU64 = AtomicU64::new(1);

/// Returns the configuration every harness starts from: no retries, small
/// pages and small chunks so paging and chunking are exercised.
pub fn test_config() -> SyncConfig {
    SyncConfig::new(TEST_THREAD, TEST_DEVICE, "mem://")
        .with_retry(RetryPolicy::no_retry())
        .with_page_limit(2)
        .with_chunk_size(4)
}

/// An engine fixture with automatic cleanup.
pub struct TestHarness {
    /// The remote the engine talks to.
    pub remote: Arc<MemoryRemote>,
    /// The on-disk state store.
    pub store: Arc<FileStateStore>,
    /// The local mirror.
    pub workspace: Arc<LocalWorkspace>,
    config: SyncConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestHarness {
    /// Creates a harness with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates a harness whose configuration is adjusted by `f`.
    pub fn with_config(f: impl FnOnce(SyncConfig) -> SyncConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = f(test_config());
        let store = FileStateStore::open(temp_dir.path().join("state"))
            .expect("Failed to open state store")
            .with_ledger_capacity(config.ledger_capacity);

        Self {
            remote: Arc::new(MemoryRemote::new(config.thread_id.clone())),
            store: Arc::new(store),
            workspace: Arc::new(LocalWorkspace::new(temp_dir.path().join("mirror"))),
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Builds an engine over the harness's remote, store and workspace.
    ///
    /// Building a new engine recovers the operation journal, the way a
    /// restarted process would.
    pub fn engine(&self) -> TestEngine {
        SyncEngine::new(
            self.config.clone(),
            self.remote.clone(),
            self.store.clone(),
            self.workspace.clone(),
        )
        .expect("Failed to build engine")
    }

    /// Builds an engine behind an `Arc`, for schedulers and listeners.
    pub fn shared_engine(&self) -> Arc<TestEngine> {
        Arc::new(self.engine())
    }

    /// Reopens the state store from disk, simulating a process restart.
    ///
    /// Every engine built from this harness must be dropped first, or the
    /// thread lock is still held.
    pub fn restart(&mut self) {
        let root = self.store.root().to_path_buf();
        self.store = Arc::new(
            FileStateStore::open(root)
                .expect("Failed to reopen state store")
                .with_ledger_capacity(self.config.ledger_capacity),
        );
    }

    /// Returns the directory holding the state store.
    pub fn state_dir(&self) -> &Path {
        self.store.root()
    }

    /// Returns the mirrored thread's directory.
    pub fn thread_dir(&self) -> PathBuf {
        self.workspace.root().join(&self.config.thread_id)
    }

    /// Returns the on-disk path of a mirrored file.
    pub fn local_path(&self, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .fold(self.thread_dir(), |path, segment| path.join(segment))
    }

    /// Writes a local file as a user edit would.
    ///
    /// The modification time is moved forward so the edit is visible even
    /// when size and timestamp granularity would hide it.
    pub fn write_local(&self, relative_path: &str, bytes: impl AsRef<[u8]>) {
        let path = self.local_path(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, bytes).expect("Failed to write local file");

        let bump = MTIME_BUMP.fetch_add(1, Ordering::Relaxed);
        let mtime = SystemTime::now() + Duration::from_secs(bump);
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(mtime))
            .expect("Failed to set modification time");
    }

    /// Reads a local file, `None` if it does not exist.
    pub fn read_local(&self, relative_path: &str) -> Option<Vec<u8>> {
        fs::read(self.local_path(relative_path)).ok()
    }

    /// Deletes a local file.
    pub fn remove_local(&self, relative_path: &str) {
        fs::remove_file(self.local_path(relative_path)).expect("Failed to remove local file");
    }

    /// Lists every mirrored file as a sorted relative path, skipping
    /// in-flight temporary files.
    pub fn local_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(&self.thread_dir(), "", &mut files);
        files.sort();
        files
    }

    /// Returns the stored cursor token.
    pub fn cursor(&self) -> Option<String> {
        self.store
            .get_cursor(&self.config.thread_id)
            .expect("Failed to read cursor")
            .map(|cursor| cursor.as_str().to_string())
    }

    /// Returns the stored record of a file.
    pub fn record(&self, relative_path: &str) -> Option<FileRecord> {
        self.store
            .get_file_record(&self.config.thread_id, relative_path)
            .expect("Failed to read file record")
    }

    /// Returns a copy of the whole thread state.
    pub fn state(&self) -> ThreadState {
        self.store
            .read(&self.config.thread_id, |state| state.clone())
            .expect("Failed to read thread state")
    }

    /// Asserts that every remote file is mirrored locally with identical
    /// content and a record at the remote revision.
    pub fn assert_mirrors_remote(&self) {
        for path in self.remote.files() {
            let expected = self.remote.content(&path);
            assert_eq!(self.read_local(&path), expected, "content of {path}");

            let record = self.record(&path).unwrap_or_else(|| panic!("no record for {path}"));
            assert_eq!(
                Some(record.last_synced_revision_id),
                self.remote.revision_of(&path),
                "revision of {path}"
            );
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, &relative, out);
        } else if !name.ends_with(TEMP_SUFFIX) {
            out.push(relative);
        }
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
