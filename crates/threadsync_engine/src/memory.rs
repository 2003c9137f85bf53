//! In-memory server for tests.
//!
//! [`MemoryRemote`] behaves like the sync API for a single thread: it keeps
//! revisions, a change log that manifest cursors index into, upload
//! sessions and an idempotency ledger. Faults can be queued per call kind,
//! hooks can run just before a call is served, and every call is counted so
//! tests can assert on traffic.
//!
//! [`MemoryFeed`] plays back scripted change-feed connections.

use crate::error::{SyncError, SyncResult};
use crate::transport::{
    CommitOutcome, DeleteOutcome, Download, DownloadBody, FeedSource, FeedStream, RemoteStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use threadsync_protocol::{
    sha256_hex, ChunkAck, ChunkUpload, CommitRequest, ContentRange, DeleteRequest, EventId,
    FeedMessage, ManifestEntry, ManifestPage, RemoteFile, SyncCursor,
};

const CURSOR_PREFIX: &str = "cursor-";

/// Which call a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// Manifest page fetches.
    Manifest,
    /// Content downloads.
    Download,
    /// Chunk uploads.
    Chunk,
    /// Commits.
    Commit,
    /// Deletes.
    Delete,
}

/// An injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Connection failure before the call takes effect.
    Network,
    /// Deadline exceeded before the call takes effect.
    Timeout,
    /// HTTP status error.
    Status(u16),
    /// 429 with a delay hint.
    RateLimited {
        /// Hint in milliseconds.
        retry_after_ms: u64,
    },
    /// Download body ends cleanly after this many bytes of the requested range.
    Truncate {
        /// Bytes delivered.
        bytes: usize,
    },
    /// Download body breaks with a connection reset after this many bytes.
    Interrupt {
        /// Bytes delivered before the break.
        after: usize,
    },
    /// Download returns content with one byte flipped.
    Corrupt,
    /// The call takes effect but the response never arrives.
    LostResponse,
}

impl Fault {
    fn into_error(self) -> SyncError {
        match self {
            Fault::Timeout => SyncError::Timeout,
            Fault::Status(status) if status >= 500 => SyncError::Server {
                status,
                message: "injected".into(),
                retryable: true,
            },
            Fault::Status(status) => SyncError::Client {
                status,
                code: "injected".into(),
                message: "injected".into(),
            },
            Fault::RateLimited { retry_after_ms } => SyncError::RateLimited {
                retry_after: Some(Duration::from_millis(retry_after_ms)),
            },
            _ => SyncError::Network("injected connection reset".into()),
        }
    }
}

#[derive(Debug)]
struct ArmedFault {
    target: FaultTarget,
    path: Option<String>,
    fault: Fault,
}

impl ArmedFault {
    fn matches(&self, target: FaultTarget, path: Option<&str>) -> bool {
        self.target == target
            && match (&self.path, path) {
                (None, _) => true,
                (Some(wanted), Some(actual)) => wanted == actual,
                (Some(_), None) => false,
            }
    }
}

type Hook = Box<dyn FnOnce() + Send>;

struct ArmedHook {
    target: FaultTarget,
    path: String,
    hook: Hook,
}

impl fmt::Debug for ArmedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmedHook")
            .field("target", &self.target)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Counters of calls made against a [`MemoryRemote`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    /// Cursor of every manifest request, in order.
    pub manifest_cursors: Vec<Option<String>>,
    /// `(path, offset)` of every download request.
    pub downloads: Vec<(String, u64)>,
    /// Chunk upload requests received.
    pub chunk_requests: u64,
    /// Chunks actually stored (duplicates excluded).
    pub chunks_stored: u64,
    /// Commit requests received.
    pub commits: u64,
    /// Delete requests received.
    pub deletes: u64,
}

impl CallLog {
    /// Number of transfer calls of any kind.
    pub fn transfers(&self) -> u64 {
        self.downloads.len() as u64 + self.chunk_requests + self.commits + self.deletes
    }
}

#[derive(Debug, Clone)]
struct Revision {
    path: String,
    bytes: Vec<u8>,
    mtime_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Change {
    seq: u64,
    path: String,
    revision_id: Option<String>,
}

#[derive(Debug)]
struct UploadSession {
    path: String,
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Clone)]
enum LedgerOutcome {
    Chunk,
    Commit(CommitOutcome),
    Delete(DeleteOutcome),
}

#[derive(Debug, Default)]
struct Inner {
    current: BTreeMap<String, String>,
    revisions: HashMap<String, Revision>,
    changes: Vec<Change>,
    next_seq: u64,
    next_revision: u64,
    uploads: HashMap<String, UploadSession>,
    ledger: HashMap<String, LedgerOutcome>,
    scripted_pages: VecDeque<ManifestPage>,
    faults: VecDeque<ArmedFault>,
    calls: CallLog,
}

impl Inner {
    fn take_fault(&mut self, target: FaultTarget, path: Option<&str>) -> Option<Fault> {
        let index = self.faults.iter().position(|f| f.matches(target, path))?;
        self.faults.remove(index).map(|f| f.fault)
    }

    fn new_revision(&mut self, path: &str, bytes: Vec<u8>, mtime_utc: DateTime<Utc>) -> String {
        self.next_revision += 1;
        let revision_id = format!("rev-{}", self.next_revision);
        self.revisions.insert(
            revision_id.clone(),
            Revision {
                path: path.to_string(),
                bytes,
                mtime_utc,
            },
        );
        self.current.insert(path.to_string(), revision_id.clone());
        self.log(path, Some(revision_id.clone()));
        revision_id
    }

    fn tombstone(&mut self, path: &str) -> Option<String> {
        self.current.remove(path)?;
        self.next_revision += 1;
        let revision_id = format!("rev-{}", self.next_revision);
        self.log(path, None);
        Some(revision_id)
    }

    fn log(&mut self, path: &str, revision_id: Option<String>) {
        self.next_seq += 1;
        self.changes.push(Change {
            seq: self.next_seq,
            path: path.to_string(),
            revision_id,
        });
    }

    fn manifest(&self, cursor: Option<&SyncCursor>, limit: u32) -> SyncResult<ManifestPage> {
        let after = match cursor {
            None => 0,
            Some(cursor) => cursor
                .as_str()
                .strip_prefix(CURSOR_PREFIX)
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| SyncError::Client {
                    status: 400,
                    code: "invalid_cursor".into(),
                    message: format!("unknown cursor {cursor}"),
                })?,
        };

        // Latest change per path, in log order.
        let mut latest: BTreeMap<&str, &Change> = BTreeMap::new();
        for change in self.changes.iter().filter(|c| c.seq > after) {
            latest.insert(&change.path, change);
        }
        let mut pending: Vec<&Change> = latest.into_values().collect();
        pending.sort_by_key(|c| c.seq);

        let limit = limit.max(1) as usize;
        let has_more = pending.len() > limit;
        let mut entries = Vec::new();
        for change in pending.into_iter().take(limit) {
            let cursor = SyncCursor::parse(format!("{CURSOR_PREFIX}{}", change.seq))?;
            let entry = match &change.revision_id {
                None => ManifestEntry::tombstone(&change.path, cursor),
                Some(revision_id) => {
                    let revision = self.revisions.get(revision_id).ok_or_else(|| {
                        SyncError::Server {
                            status: 500,
                            message: format!("missing revision {revision_id}"),
                            retryable: false,
                        }
                    })?;
                    ManifestEntry::upsert(
                        &change.path,
                        cursor,
                        RemoteFile {
                            revision_id: revision_id.clone(),
                            sha256: sha256_hex(&revision.bytes),
                            size: Some(revision.bytes.len() as u64),
                            mtime_utc: Some(revision.mtime_utc),
                        },
                    )
                }
            };
            entries.push(entry);
        }

        let next_cursor = entries.last().map(|e| e.cursor().clone()).or_else(|| cursor.cloned());
        let mut page = ManifestPage::new(entries, next_cursor, has_more);
        page.server_time_utc = Some(Utc::now());
        Ok(page)
    }
}

/// In-memory sync server for one thread.
#[derive(Debug)]
pub struct MemoryRemote {
    thread_id: String,
    inner: Mutex<Inner>,
    hooks: Mutex<Vec<ArmedHook>>,
}

impl MemoryRemote {
    /// Creates an empty server for `thread_id`.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            inner: Mutex::new(Inner::default()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Creates or replaces a file as another device would; returns the new
    /// revision id.
    pub fn put_file(&self, path: &str, bytes: impl Into<Vec<u8>>) -> String {
        self.inner.lock().new_revision(path, bytes.into(), Utc::now())
    }

    /// Deletes a file as another device would.
    pub fn remove_file(&self, path: &str) {
        self.inner.lock().tombstone(path);
    }

    /// Current revision of a path.
    pub fn revision_of(&self, path: &str) -> Option<String> {
        self.inner.lock().current.get(path).cloned()
    }

    /// Current content of a path.
    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let revision_id = inner.current.get(path)?;
        inner.revisions.get(revision_id).map(|r| r.bytes.clone())
    }

    /// Paths that currently exist.
    pub fn files(&self) -> Vec<String> {
        self.inner.lock().current.keys().cloned().collect()
    }

    /// Serves `page` for the next manifest request instead of computing one.
    pub fn push_page(&self, page: ManifestPage) {
        self.inner.lock().scripted_pages.push_back(page);
    }

    /// Queues a fault for the next call of `target`.
    pub fn fail_next(&self, target: FaultTarget, fault: Fault) {
        self.inner.lock().faults.push_back(ArmedFault {
            target,
            path: None,
            fault,
        });
    }

    /// Queues a fault for the next call of `target` on `path`.
    pub fn fail_next_for(&self, target: FaultTarget, path: &str, fault: Fault) {
        self.inner.lock().faults.push_back(ArmedFault {
            target,
            path: Some(path.to_string()),
            fault,
        });
    }

    /// Runs `hook` once, right before the next call of `target` on `path` is
    /// served. The server lock is not held while the hook runs.
    pub fn on_next_call(
        &self,
        target: FaultTarget,
        path: &str,
        hook: impl FnOnce() + Send + 'static,
    ) {
        self.hooks.lock().push(ArmedHook {
            target,
            path: path.to_string(),
            hook: Box::new(hook),
        });
    }

    fn run_hook(&self, target: FaultTarget, path: &str) {
        let armed = {
            let mut hooks = self.hooks.lock();
            hooks
                .iter()
                .position(|h| h.target == target && h.path == path)
                .map(|index| hooks.remove(index))
        };
        if let Some(armed) = armed {
            (armed.hook)();
        }
    }

    /// Returns a copy of the call counters.
    pub fn calls(&self) -> CallLog {
        self.inner.lock().calls.clone()
    }

    /// Clears the call counters.
    pub fn reset_calls(&self) {
        self.inner.lock().calls = CallLog::default();
    }

    fn check_thread(&self, thread_id: &str) -> SyncResult<()> {
        if thread_id == self.thread_id {
            Ok(())
        } else {
            Err(SyncError::Client {
                status: 404,
                code: "thread_not_found".into(),
                message: format!("unknown thread {thread_id}"),
            })
        }
    }
}

/// Download body served from memory.
struct MemoryBody {
    pieces: VecDeque<Vec<u8>>,
    then: Option<SyncError>,
}

#[async_trait]
impl DownloadBody for MemoryBody {
    async fn next_piece(&mut self) -> SyncResult<Option<Vec<u8>>> {
        if let Some(piece) = self.pieces.pop_front() {
            return Ok(Some(piece));
        }
        match self.then.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

fn bad_request(code: &str, message: impl Into<String>) -> SyncError {
    SyncError::Client {
        status: 400,
        code: code.into(),
        message: message.into(),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_manifest(
        &self,
        thread_id: &str,
        cursor: Option<&SyncCursor>,
        limit: u32,
    ) -> SyncResult<ManifestPage> {
        self.check_thread(thread_id)?;
        let mut inner = self.inner.lock();
        inner
            .calls
            .manifest_cursors
            .push(cursor.map(|c| c.as_str().to_string()));
        if let Some(fault) = inner.take_fault(FaultTarget::Manifest, None) {
            return Err(fault.into_error());
        }
        if let Some(page) = inner.scripted_pages.pop_front() {
            return Ok(page);
        }
        inner.manifest(cursor, limit)
    }

    async fn download(
        &self,
        thread_id: &str,
        path: &str,
        revision_id: Option<&str>,
        offset: u64,
    ) -> SyncResult<Download> {
        self.check_thread(thread_id)?;
        self.run_hook(FaultTarget::Download, path);
        let mut inner = self.inner.lock();
        inner.calls.downloads.push((path.to_string(), offset));

        let fault = inner.take_fault(FaultTarget::Download, Some(path));
        match fault {
            None
            | Some(Fault::Truncate { .. })
            | Some(Fault::Interrupt { .. })
            | Some(Fault::Corrupt) => {}
            Some(other) => return Err(other.into_error()),
        }

        let revision_id = match revision_id {
            Some(id) => id.to_string(),
            None => inner.current.get(path).cloned().ok_or_else(|| SyncError::Client {
                status: 404,
                code: "not_found".into(),
                message: format!("{path} does not exist"),
            })?,
        };
        let revision = inner
            .revisions
            .get(&revision_id)
            .filter(|r| r.path == path)
            .ok_or_else(|| SyncError::Client {
                status: 404,
                code: "not_found".into(),
                message: format!("{path}@{revision_id} does not exist"),
            })?;

        let total = revision.bytes.len() as u64;
        if offset > total {
            return Err(SyncError::Client {
                status: 416,
                code: "range_not_satisfiable".into(),
                message: format!("offset {offset} beyond {total}"),
            });
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut bytes = revision.bytes[start..].to_vec();
        let mut then = None;
        match fault {
            Some(Fault::Truncate { bytes: keep }) => bytes.truncate(keep),
            Some(Fault::Interrupt { after }) => {
                bytes.truncate(after);
                then = Some(SyncError::Network("injected connection reset".into()));
            }
            Some(Fault::Corrupt) => match bytes.first_mut() {
                Some(first) => *first ^= 0xff,
                None => bytes.push(0),
            },
            _ => {}
        }

        let pieces = if bytes.is_empty() {
            VecDeque::new()
        } else {
            VecDeque::from([bytes])
        };
        Ok(Download {
            range: ContentRange {
                start: offset,
                total: Some(total),
            },
            body: Box::new(MemoryBody { pieces, then }),
        })
    }

    async fn upload_chunk(&self, chunk: &ChunkUpload) -> SyncResult<ChunkAck> {
        self.check_thread(&chunk.thread_id)?;
        self.run_hook(FaultTarget::Chunk, &chunk.path);
        let mut inner = self.inner.lock();
        inner.calls.chunk_requests += 1;

        let fault = inner.take_fault(FaultTarget::Chunk, Some(&chunk.path));
        if let Some(fault) = &fault {
            if *fault != Fault::LostResponse {
                return Err(fault.clone().into_error());
            }
        }

        let key = chunk.idempotency_key();
        if inner.ledger.contains_key(&key) {
            return Ok(ChunkAck {
                chunk_index: chunk.chunk_index,
                duplicate: true,
            });
        }
        if sha256_hex(&chunk.bytes) != chunk.chunk_sha256 {
            return Err(bad_request("chunk_checksum", "chunk hash does not match"));
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(bad_request("chunk_index", "chunk index out of range"));
        }

        let session = inner
            .uploads
            .entry(chunk.upload_id.clone())
            .or_insert_with(|| UploadSession {
                path: chunk.path.clone(),
                total_chunks: chunk.total_chunks,
                chunks: BTreeMap::new(),
            });
        if session.path != chunk.path || session.total_chunks != chunk.total_chunks {
            return Err(bad_request("upload_mismatch", "upload session mismatch"));
        }
        session.chunks.insert(chunk.chunk_index, chunk.bytes.clone());
        inner.calls.chunks_stored += 1;
        inner.ledger.insert(key, LedgerOutcome::Chunk);

        if fault.is_some() {
            return Err(Fault::LostResponse.into_error());
        }
        Ok(ChunkAck {
            chunk_index: chunk.chunk_index,
            duplicate: false,
        })
    }

    async fn commit(&self, request: &CommitRequest) -> SyncResult<CommitOutcome> {
        self.check_thread(&request.thread_id)?;
        self.run_hook(FaultTarget::Commit, &request.path);
        let mut inner = self.inner.lock();
        inner.calls.commits += 1;

        let fault = inner.take_fault(FaultTarget::Commit, Some(&request.path));
        if let Some(fault) = &fault {
            if *fault != Fault::LostResponse {
                return Err(fault.clone().into_error());
            }
        }

        let key = request.idempotency_key();
        if let Some(LedgerOutcome::Commit(outcome)) = inner.ledger.get(&key) {
            return Ok(outcome.clone());
        }

        let current = inner.current.get(&request.path).cloned();
        if let Some(expected) = &request.if_match_revision_id {
            if current.as_ref() != Some(expected) {
                return Ok(CommitOutcome::Conflict {
                    current_revision_id: current,
                });
            }
        }

        let session = inner
            .uploads
            .remove(&request.upload_id)
            .ok_or_else(|| bad_request("unknown_upload", "no chunks were uploaded"))?;
        let complete = session.chunks.len() as u32 == session.total_chunks
            && session.chunks.keys().copied().eq(0..session.total_chunks);
        let content: Vec<u8> = session.chunks.values().flatten().copied().collect();
        if !complete
            || session.path != request.path
            || content.len() as u64 != request.size
            || sha256_hex(&content) != request.final_sha256
        {
            return Err(bad_request("commit_mismatch", "upload does not match commit"));
        }

        let revision_id = inner.new_revision(&request.path, content, request.mtime_utc);
        let outcome = CommitOutcome::Committed { revision_id };
        inner.ledger.insert(key, LedgerOutcome::Commit(outcome.clone()));

        if fault.is_some() {
            return Err(Fault::LostResponse.into_error());
        }
        Ok(outcome)
    }

    async fn delete(&self, request: &DeleteRequest) -> SyncResult<DeleteOutcome> {
        self.check_thread(&request.thread_id)?;
        self.run_hook(FaultTarget::Delete, &request.path);
        let mut inner = self.inner.lock();
        inner.calls.deletes += 1;

        let fault = inner.take_fault(FaultTarget::Delete, Some(&request.path));
        if let Some(fault) = &fault {
            if *fault != Fault::LostResponse {
                return Err(fault.clone().into_error());
            }
        }

        if let Some(LedgerOutcome::Delete(outcome)) = inner.ledger.get(&request.idempotency_key) {
            return Ok(outcome.clone());
        }

        let current = inner.current.get(&request.path).cloned();
        if let Some(expected) = &request.if_match_revision_id {
            if current.is_some() && current.as_ref() != Some(expected) {
                return Ok(DeleteOutcome::Conflict {
                    current_revision_id: current,
                });
            }
        }

        let outcome = DeleteOutcome::Deleted {
            revision_id: inner.tombstone(&request.path),
        };
        inner
            .ledger
            .insert(request.idempotency_key.clone(), LedgerOutcome::Delete(outcome.clone()));

        if fault.is_some() {
            return Err(Fault::LostResponse.into_error());
        }
        Ok(outcome)
    }
}

/// Outcome of one scripted feed connection.
#[derive(Debug, Clone)]
pub enum FeedScript {
    /// The connection fails with a network error.
    Fail,
    /// The server reports that it cannot resume (HTTP 410).
    Gap,
    /// The connection delivers these messages, then closes.
    Stream(Vec<FeedMessage>),
}

/// Scripted [`FeedSource`]. Once the script is exhausted, subscriptions stay
/// open without delivering anything.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    script: Mutex<VecDeque<FeedScript>>,
    subscriptions: Mutex<Vec<Option<String>>>,
}

impl MemoryFeed {
    /// Creates a feed with the given connection script.
    pub fn new(script: impl IntoIterator<Item = FeedScript>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Appends a connection outcome.
    pub fn push(&self, script: FeedScript) {
        self.script.lock().push_back(script);
    }

    /// `Last-Event-ID` of every subscription, in order.
    pub fn subscriptions(&self) -> Vec<Option<String>> {
        self.subscriptions.lock().clone()
    }
}

struct ScriptedStream {
    messages: VecDeque<FeedMessage>,
    hold_open: bool,
}

#[async_trait]
impl FeedStream for ScriptedStream {
    async fn next_message(&mut self) -> SyncResult<Option<FeedMessage>> {
        if let Some(message) = self.messages.pop_front() {
            return Ok(Some(message));
        }
        if self.hold_open {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }
}

#[async_trait]
impl FeedSource for MemoryFeed {
    async fn subscribe(
        &self,
        _thread_id: &str,
        last_event_id: Option<&EventId>,
    ) -> SyncResult<Box<dyn FeedStream>> {
        self.subscriptions
            .lock()
            .push(last_event_id.map(|id| id.as_str().to_string()));

        let next = self.script.lock().pop_front();
        match next {
            Some(FeedScript::Fail) => Err(SyncError::Network("feed connection refused".into())),
            Some(FeedScript::Gap) => Err(SyncError::FeedGap),
            Some(FeedScript::Stream(messages)) => Ok(Box::new(ScriptedStream {
                messages: messages.into(),
                hold_open: false,
            })),
            None => Ok(Box::new(ScriptedStream {
                messages: VecDeque::new(),
                hold_open: true,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_for(remote_thread: &str, upload_id: &str, path: &str, bytes: &[u8]) -> CommitRequest {
        CommitRequest {
            upload_id: upload_id.into(),
            thread_id: remote_thread.into(),
            path: path.into(),
            final_sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
            mtime_utc: Utc::now(),
            if_match_revision_id: None,
        }
    }

    async fn read_body(download: &mut Download) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        while let Some(piece) = download.body.next_piece().await? {
            bytes.extend_from_slice(&piece);
        }
        Ok(bytes)
    }

    fn chunk(upload_id: &str, path: &str, bytes: &[u8]) -> ChunkUpload {
        ChunkUpload {
            upload_id: upload_id.into(),
            thread_id: "t1".into(),
            path: path.into(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_sha256: sha256_hex(bytes),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn manifest_pages_through_changes() {
        let remote = MemoryRemote::new("t1");
        remote.put_file("a.txt", "a");
        remote.put_file("b.txt", "b");
        remote.remove_file("a.txt");

        let page = remote.fetch_manifest("t1", None, 1).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].path(), "b.txt");
        assert_eq!(page.entries[0].cursor().as_str(), "cursor-2");
        assert!(page.has_more);

        let page = remote
            .fetch_manifest("t1", page.next_cursor.as_ref(), 1)
            .await
            .unwrap();
        assert!(page.entries[0].is_tombstone());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn duplicate_chunks_are_not_stored_twice() {
        let remote = MemoryRemote::new("t1");
        let upload = chunk("u1", "a.txt", b"hello");
        assert!(!remote.upload_chunk(&upload).await.unwrap().duplicate);
        assert!(remote.upload_chunk(&upload).await.unwrap().duplicate);
        assert_eq!(remote.calls().chunks_stored, 1);

        let outcome = remote
            .commit(&commit_for("t1", "u1", "a.txt", b"hello"))
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert_eq!(remote.content("a.txt").unwrap(), b"hello");

        // Replayed commit returns the stored outcome.
        let again = remote
            .commit(&commit_for("t1", "u1", "a.txt", b"hello"))
            .await
            .unwrap();
        assert_eq!(again, outcome);
    }

    #[tokio::test]
    async fn commit_checks_precondition() {
        let remote = MemoryRemote::new("t1");
        let rev = remote.put_file("a.txt", "server");
        remote.upload_chunk(&chunk("u1", "a.txt", b"mine")).await.unwrap();

        let mut request = commit_for("t1", "u1", "a.txt", b"mine");
        request.if_match_revision_id = Some("rev-0".into());
        let outcome = remote.commit(&request).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Conflict {
                current_revision_id: Some(rev)
            }
        );
    }

    #[tokio::test]
    async fn faults_fire_once() {
        let remote = MemoryRemote::new("t1");
        remote.put_file("a.txt", "abcdef");
        remote.fail_next(FaultTarget::Download, Fault::Truncate { bytes: 2 });

        let mut download = remote.download("t1", "a.txt", None, 0).await.unwrap();
        assert_eq!(read_body(&mut download).await.unwrap(), b"ab");
        assert!(!download.range.is_complete(2));

        let mut download = remote.download("t1", "a.txt", None, 2).await.unwrap();
        assert_eq!(download.range.start, 2);
        assert_eq!(read_body(&mut download).await.unwrap(), b"cdef");
        assert_eq!(remote.calls().downloads.len(), 2);
    }

    #[tokio::test]
    async fn interrupted_body_breaks_after_prefix() {
        let remote = MemoryRemote::new("t1");
        remote.put_file("a.txt", "abcdef");
        remote.fail_next(FaultTarget::Download, Fault::Interrupt { after: 3 });

        let mut download = remote.download("t1", "a.txt", None, 0).await.unwrap();
        assert_eq!(download.body.next_piece().await.unwrap(), Some(b"abc".to_vec()));
        assert!(matches!(
            download.body.next_piece().await,
            Err(SyncError::Network(_))
        ));
    }

    #[tokio::test]
    async fn hooks_run_once_before_the_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let remote = Arc::new(MemoryRemote::new("t1"));
        remote.put_file("a.txt", "abc");
        let seen = Arc::new(AtomicUsize::new(0));
        let hook_remote = Arc::clone(&remote);
        let hook_seen = Arc::clone(&seen);
        remote.on_next_call(FaultTarget::Download, "a.txt", move || {
            hook_seen.store(hook_remote.calls().downloads.len(), Ordering::SeqCst);
            hook_remote.put_file("b.txt", "from hook");
        });

        remote.download("t1", "a.txt", None, 0).await.unwrap();
        remote.download("t1", "a.txt", None, 0).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(remote.files(), vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn other_threads_are_rejected() {
        let remote = MemoryRemote::new("t1");
        assert!(matches!(
            remote.fetch_manifest("t2", None, 10).await,
            Err(SyncError::Client { status: 404, .. })
        ));
    }
}
