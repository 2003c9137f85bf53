//! Manifest reconciliation.
//!
//! A pass pulls manifest pages from the stored cursor, applies every item in
//! page order and persists the item cursor right after the item is durably
//! applied. Once the manifest is drained, local edits are pushed.
//!
//! The stored cursor therefore never runs ahead of applied state: a failed
//! item stops the pass with the cursor at the previous item, and the next
//! pass requests the manifest from there.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::conflict::{classify, ConflictResolver, LocalChange, RemoteChange, Verdict};
use crate::error::{SyncError, SyncResult};
use crate::model::{FileRecord, LastError, Resolution};
use crate::store::StateStore;
use crate::transfer::TransferEngine;
use crate::transport::{CommitOutcome, DeleteOutcome, RemoteStore};
use crate::workspace::{LocalFileState, WorkspaceProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use threadsync_protocol::{sha256_hex, ManifestEntry, ManifestPage, RemoteFile, SyncCursor};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Manifest pages fetched.
    pub pages: u32,
    /// Remote versions written locally.
    pub downloaded: u32,
    /// Local files removed for tombstones.
    pub deleted: u32,
    /// Records refreshed without a transfer.
    pub adopted: u32,
    /// Items that needed nothing.
    pub skipped: u32,
    /// Conflicts parked.
    pub conflicts: u32,
    /// Local edits committed.
    pub uploaded: u32,
    /// Local deletions propagated.
    pub remote_deleted: u32,
    /// Cursor stored at the end of the pass.
    pub final_cursor: Option<SyncCursor>,
    /// The push phase met a newer remote revision; another pass brings it in.
    pub follow_up: bool,
}

impl PassReport {
    /// Number of items that changed something.
    pub fn changes(&self) -> u32 {
        self.downloaded
            + self.deleted
            + self.adopted
            + self.conflicts
            + self.uploaded
            + self.remote_deleted
    }
}

type DownloadTask = JoinHandle<SyncResult<Vec<u8>>>;

/// A spawned download that is cancelled when dropped unused.
struct Prefetched(DownloadTask);

impl Drop for Prefetched {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Downloads running ahead of the item being applied.
struct Prefetch {
    window: usize,
    next_index: usize,
    running: HashMap<usize, Prefetched>,
}

impl Prefetch {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            next_index: 0,
            running: HashMap::new(),
        }
    }

    fn take(&mut self, index: usize) -> Option<Prefetched> {
        self.running.remove(&index)
    }
}

/// Runs reconciliation passes for one thread.
pub struct Reconciler<R: RemoteStore, S: StateStore, W: WorkspaceProvider> {
    thread_id: String,
    page_limit: u32,
    push_local_changes: bool,
    prefetch_window: usize,
    store: Arc<S>,
    workspace: Arc<W>,
    transfer: Arc<TransferEngine<R, S>>,
    resolver: Arc<ConflictResolver<S, W>>,
}

impl<R, S, W> Reconciler<R, S, W>
where
    R: RemoteStore + 'static,
    S: StateStore + 'static,
    W: WorkspaceProvider + 'static,
{
    /// Creates a reconciler sharing the given collaborators.
    pub fn new(
        config: &SyncConfig,
        store: Arc<S>,
        workspace: Arc<W>,
        transfer: Arc<TransferEngine<R, S>>,
        resolver: Arc<ConflictResolver<S, W>>,
    ) -> Self {
        Self {
            thread_id: config.thread_id.clone(),
            page_limit: config.page_limit,
            push_local_changes: config.push_local_changes,
            prefetch_window: config.max_concurrent_transfers,
            store,
            workspace,
            transfer,
            resolver,
        }
    }

    /// Runs one full pass.
    ///
    /// On failure the error is also stored as the thread's last error; a
    /// successful pass clears it.
    pub async fn run_pass(&self, cancel: &CancelToken) -> SyncResult<PassReport> {
        let span = tracing::info_span!("sync_pass", thread = %self.thread_id);
        async {
            let mut report = PassReport::default();
            let result = self.pull_and_push(&mut report, cancel).await;
            report.final_cursor = self.store.get_cursor(&self.thread_id).ok().flatten();

            match &result {
                Ok(()) => {
                    self.store.set_last_error(&self.thread_id, None)?;
                    info!(
                        pages = report.pages,
                        downloaded = report.downloaded,
                        deleted = report.deleted,
                        adopted = report.adopted,
                        conflicts = report.conflicts,
                        uploaded = report.uploaded,
                        remote_deleted = report.remote_deleted,
                        cursor = ?report.final_cursor.as_ref().map(SyncCursor::as_str),
                        "pass complete"
                    );
                }
                Err(SyncError::Cancelled) => info!("pass cancelled"),
                Err(e) => {
                    warn!(error = %e, path = ?e.path(), "pass failed");
                    let recorded = self
                        .store
                        .set_last_error(&self.thread_id, Some(LastError::from_error(e)));
                    if let Err(store_error) = recorded {
                        warn!(error = %store_error, "could not record last error");
                    }
                }
            }
            result.map(|()| report)
        }
        .instrument(span)
        .await
    }

    async fn pull_and_push(&self, report: &mut PassReport, cancel: &CancelToken) -> SyncResult<()> {
        self.workspace.ensure_workspace(&self.thread_id).await?;
        self.pull(report, cancel).await?;
        if self.push_local_changes {
            self.push(report, cancel).await?;
        }
        Ok(())
    }

    async fn pull(&self, report: &mut PassReport, cancel: &CancelToken) -> SyncResult<()> {
        let mut request = self.store.get_cursor(&self.thread_id)?;
        let mut requested: HashSet<String> = HashSet::new();

        loop {
            cancel.check()?;
            if let Some(cursor) = &request {
                requested.insert(cursor.as_str().to_string());
            }

            let page = self
                .transfer
                .fetch_manifest(request.as_ref(), self.page_limit, cancel)
                .await?;
            report.pages += 1;
            debug!(
                cursor = ?request.as_ref().map(SyncCursor::as_str),
                items = page.entries.len(),
                has_more = page.has_more,
                "manifest page"
            );

            // Checked before applying anything so a stalled page leaves no trace.
            let next = if page.has_more {
                match &page.next_cursor {
                    Some(next) if !requested.contains(next.as_str()) => Some(next.clone()),
                    other => {
                        return Err(SyncError::CursorStall {
                            cursor: other.as_ref().map(|c| c.as_str().to_string()),
                        })
                    }
                }
            } else {
                None
            };

            self.apply_page(&page, report, cancel).await?;

            match next {
                Some(next) => request = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn apply_page(
        &self,
        page: &ManifestPage,
        report: &mut PassReport,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        let mut prefetch = Prefetch::new(self.prefetch_window);
        for (index, entry) in page.entries.iter().enumerate() {
            cancel.check()?;
            self.fill_prefetch(&mut prefetch, &page.entries, index, cancel)
                .await
                .map_err(|e| e.for_item(entry.path()))?;

            let prefetched = prefetch.take(index);
            self.apply_entry(entry, prefetched, report, cancel)
                .await
                .map_err(|e| e.for_item(entry.path()))?;
            self.store.set_cursor(&self.thread_id, entry.cursor())?;
        }
        Ok(())
    }

    /// Starts downloads for upcoming items that will most likely need one.
    async fn fill_prefetch(
        &self,
        prefetch: &mut Prefetch,
        entries: &[ManifestEntry],
        current: usize,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        prefetch.next_index = prefetch.next_index.max(current);
        while prefetch.next_index < entries.len() && prefetch.running.len() < prefetch.window {
            let index = prefetch.next_index;
            prefetch.next_index += 1;

            let ManifestEntry::Upsert { path, remote, .. } = &entries[index] else {
                continue;
            };
            if !self.likely_download(path, remote).await? {
                continue;
            }

            let transfer = Arc::clone(&self.transfer);
            let path = path.clone();
            let remote = remote.clone();
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move { transfer.download(&path, &remote, &cancel).await });
            prefetch.running.insert(index, Prefetched(handle));
        }
        Ok(())
    }

    async fn likely_download(&self, path: &str, remote: &RemoteFile) -> SyncResult<bool> {
        match self.store.get_file_record(&self.thread_id, path)? {
            Some(record) => Ok(record.last_synced_revision_id != remote.revision_id
                && record.sha256 != remote.sha256),
            None => Ok(self
                .workspace
                .metadata(&self.thread_id, path)
                .await?
                .is_none()),
        }
    }

    async fn apply_entry(
        &self,
        entry: &ManifestEntry,
        prefetched: Option<Prefetched>,
        report: &mut PassReport,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        let path = entry.path();
        let record = self.store.get_file_record(&self.thread_id, path)?;
        let local = self.resolver.local_change(path, record.as_ref()).await?;

        match entry {
            ManifestEntry::Upsert { remote, .. } => {
                let verdict = classify(record.as_ref(), &local, RemoteChange::Upsert(remote));
                debug!(path, revision = %remote.revision_id, ?verdict, "applying upsert");
                match verdict {
                    Verdict::Current | Verdict::LocalOnly => report.skipped += 1,
                    Verdict::InSync => {
                        if let LocalChange::Modified(state) | LocalChange::Untracked(state) = &local {
                            self.store.put_file_record(
                                &self.thread_id,
                                &synced_record(path, state, &remote.revision_id),
                            )?;
                        }
                        report.adopted += 1;
                    }
                    Verdict::RemoteOnly => {
                        let bytes = self.fetch(prefetched, path, remote, cancel).await?;
                        self.write_remote(path, &bytes, &remote.revision_id).await?;
                        report.downloaded += 1;
                    }
                    Verdict::Conflict => {
                        // Download first so a failed transfer leaves the local copy in place.
                        let bytes = self.fetch(prefetched, path, remote, cancel).await?;
                        let local_sha = local_sha(&local);
                        self.resolver
                            .park(path, &local_sha, record.as_ref(), Some(remote.revision_id.clone()))
                            .await?;
                        self.write_remote(path, &bytes, &remote.revision_id).await?;
                        report.conflicts += 1;
                    }
                }
            }
            ManifestEntry::Tombstone { .. } => {
                let verdict = classify(record.as_ref(), &local, RemoteChange::Tombstone);
                debug!(path, ?verdict, "applying tombstone");
                match verdict {
                    Verdict::RemoteOnly => {
                        self.workspace.delete_file(&self.thread_id, path).await?;
                        self.store.remove_file_record(&self.thread_id, path)?;
                        report.deleted += 1;
                    }
                    Verdict::Conflict => {
                        let local_sha = local_sha(&local);
                        self.resolver
                            .park(path, &local_sha, record.as_ref(), None)
                            .await?;
                        self.store.remove_file_record(&self.thread_id, path)?;
                        report.conflicts += 1;
                    }
                    Verdict::Current | Verdict::InSync | Verdict::LocalOnly => {
                        report.skipped += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        prefetched: Option<Prefetched>,
        path: &str,
        remote: &RemoteFile,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<u8>> {
        if let Some(mut prefetched) = prefetched {
            match (&mut prefetched.0).await {
                Ok(result) => return result,
                Err(e) => warn!(path, error = %e, "prefetch task ended early; downloading inline"),
            }
        }
        self.transfer.download(path, remote, cancel).await
    }

    async fn write_remote(&self, path: &str, bytes: &[u8], revision_id: &str) -> SyncResult<()> {
        let state = self
            .workspace
            .write_file(&self.thread_id, path, bytes)
            .await?;
        self.store
            .put_file_record(&self.thread_id, &synced_record(path, &state, revision_id))
    }

    /// Uploads local edits and creations and propagates local deletions.
    ///
    /// Deletions go first so a rename (delete plus create) does not leave
    /// both names on the server longer than necessary.
    async fn push(&self, report: &mut PassReport, cancel: &CancelToken) -> SyncResult<()> {
        let records: BTreeMap<String, FileRecord> = self
            .store
            .list_file_records(&self.thread_id)?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        let files = self.workspace.list_files(&self.thread_id).await?;
        let present: HashSet<&str> = files.iter().map(String::as_str).collect();
        let parked: HashSet<String> = self
            .store
            .list_conflicts(&self.thread_id)?
            .into_iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .map(|c| c.conflict_path)
            .collect();

        for record in records.values().filter(|r| !present.contains(r.path.as_str())) {
            cancel.check()?;
            let path = record.path.as_str();
            let outcome = self
                .transfer
                .delete(path, Some(&record.last_synced_revision_id), cancel)
                .await
                .map_err(|e| e.for_item(path))?;
            match outcome {
                DeleteOutcome::Deleted { .. } => {
                    self.store.remove_file_record(&self.thread_id, path)?;
                    debug!(path, "local deletion pushed");
                    report.remote_deleted += 1;
                }
                DeleteOutcome::Conflict {
                    current_revision_id,
                } => {
                    // The newer remote version is restored by the next pull.
                    debug!(path, ?current_revision_id, "remote changed since local deletion");
                    report.follow_up = true;
                }
            }
        }

        for path in files.iter().filter(|p| !parked.contains(p.as_str())) {
            cancel.check()?;
            self.push_file(path, records.get(path), report, cancel)
                .await
                .map_err(|e| e.for_item(path.as_str()))?;
        }
        Ok(())
    }

    async fn push_file(
        &self,
        path: &str,
        record: Option<&FileRecord>,
        report: &mut PassReport,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        let state = match self.resolver.local_change(path, record).await? {
            LocalChange::Modified(state) | LocalChange::Untracked(state) => state,
            LocalChange::Unchanged | LocalChange::Missing => return Ok(()),
        };
        let Some(bytes) = self.workspace.read_file(&self.thread_id, path).await? else {
            return Ok(());
        };
        let if_match = record.map(|r| r.last_synced_revision_id.as_str());

        match self
            .transfer
            .upload(path, &bytes, state.mtime_utc, if_match, cancel)
            .await?
        {
            CommitOutcome::Committed { revision_id } => {
                let uploaded = LocalFileState {
                    sha256: sha256_hex(&bytes),
                    size: bytes.len() as u64,
                    mtime_utc: state.mtime_utc,
                };
                self.store
                    .put_file_record(&self.thread_id, &synced_record(path, &uploaded, &revision_id))?;
                debug!(path, revision = %revision_id, "local edit pushed");
                report.uploaded += 1;
            }
            CommitOutcome::Conflict {
                current_revision_id,
            } => {
                self.resolver
                    .park(path, &sha256_hex(&bytes), record, current_revision_id)
                    .await?;
                report.conflicts += 1;
                report.follow_up = true;
            }
        }
        Ok(())
    }
}

fn local_sha(local: &LocalChange) -> String {
    match local {
        LocalChange::Modified(state) | LocalChange::Untracked(state) => state.sha256.clone(),
        LocalChange::Unchanged | LocalChange::Missing => String::new(),
    }
}

fn synced_record(path: &str, state: &LocalFileState, revision_id: &str) -> FileRecord {
    FileRecord {
        path: path.to_string(),
        sha256: state.sha256.clone(),
        mtime_utc: state.mtime_utc,
        size: state.size,
        last_synced_revision_id: revision_id.to_string(),
        pending_operation: None,
    }
}
