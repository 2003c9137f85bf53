//! Transfer engine.
//!
//! Every network call of a pass goes through [`TransferEngine`], which
//! applies the request timeout, the shared [`RetryPolicy`], the transfer
//! concurrency bound and cancellation uniformly.
//!
//! - Downloads append each piece of the body to the held partial as it
//!   arrives, so bytes received before a failure survive the retry, which
//!   resumes with a byte range. The timeout applies per piece, not to the
//!   whole body. Content is verified against the manifest hash at the end.
//! - Uploads are split into chunks keyed `"{uploadId}:{chunkIndex}"`; chunks
//!   already acknowledged (per the store ledger) are not resent, and an
//!   interrupted upload resumes under its journaled upload id.
//! - Commits and deletes carry idempotency keys whose outcomes are recorded
//!   so a replay after a lost response is a no-op.

use crate::cancel::CancelToken;
use crate::config::{RetryPolicy, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    IdempotencyEntry, IdempotentCall, OperationKind, OperationStatus, SyncOperation,
};
use crate::store::StateStore;
use crate::transport::{CommitOutcome, DeleteOutcome, RemoteStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadsync_protocol::{
    chunk_idempotency_key, sha256_hex, ChunkUpload, CommitRequest, DeleteRequest, ManifestPage,
    ProtocolError, RemoteFile, SyncCursor,
};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug)]
struct PartialDownload {
    revision_id: String,
    bytes: Vec<u8>,
}

impl PartialDownload {
    fn new(revision_id: &str) -> Self {
        Self {
            revision_id: revision_id.to_string(),
            bytes: Vec::new(),
        }
    }
}

/// Transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Retries performed.
    pub retries: u64,
    /// Bytes received.
    pub bytes_downloaded: u64,
    /// Bytes sent in chunks.
    pub bytes_uploaded: u64,
}

/// Executes transfers for one thread.
pub struct TransferEngine<R: RemoteStore, S: StateStore> {
    thread_id: String,
    remote: Arc<R>,
    store: Arc<S>,
    retry: RetryPolicy,
    chunk_size: usize,
    request_timeout: Duration,
    permits: Semaphore,
    partials: Mutex<HashMap<String, PartialDownload>>,
    retries: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl<R: RemoteStore, S: StateStore> TransferEngine<R, S> {
    /// Creates an engine using the transfer settings of `config`.
    pub fn new(config: &SyncConfig, remote: Arc<R>, store: Arc<S>) -> Self {
        Self {
            thread_id: config.thread_id.clone(),
            remote,
            store,
            retry: config.retry.clone(),
            chunk_size: config.chunk_size.max(1),
            request_timeout: config.request_timeout,
            permits: Semaphore::new(config.max_concurrent_transfers.max(1)),
            partials: Mutex::new(HashMap::new()),
            retries: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
        }
    }

    /// Returns the transfer counters.
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            retries: self.retries.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }

    /// Bytes held for an interrupted download of `path`.
    pub fn partial_len(&self, path: &str) -> u64 {
        self.partials
            .lock()
            .get(path)
            .map_or(0, |p| p.bytes.len() as u64)
    }

    /// Marks operations left running by a previous process as interrupted.
    /// Returns how many were found.
    pub fn recover_journal(&self) -> SyncResult<usize> {
        let mut recovered = 0;
        for mut op in self.store.list_operations(&self.thread_id)? {
            if op.status == OperationStatus::Running {
                op.mark_interrupted();
                self.store.put_operation(&self.thread_id, &op)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(thread = %self.thread_id, recovered, "found interrupted transfers");
        }
        Ok(recovered)
    }

    /// Fetches a manifest page.
    pub async fn fetch_manifest(
        &self,
        cursor: Option<&SyncCursor>,
        limit: u32,
        cancel: &CancelToken,
    ) -> SyncResult<ManifestPage> {
        self.with_retry("manifest", None, cancel, || {
            self.remote.fetch_manifest(&self.thread_id, cursor, limit)
        })
        .await
    }

    /// Downloads and verifies the content of `remote`.
    pub async fn download(
        &self,
        path: &str,
        remote: &RemoteFile,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<u8>> {
        let mut op = SyncOperation::start(OperationKind::Download, path);
        op.content_sha256 = Some(remote.sha256.clone());
        self.store.put_operation(&self.thread_id, &op)?;

        let result = self
            .retry_loop(path, Some(&mut op), cancel, None, || {
                self.fetch_remaining(path, remote, cancel)
            })
            .await;
        self.finish(&mut op, &result)?;
        result
    }

    /// Uploads `bytes` as the new content of `path` and commits it.
    ///
    /// `if_match` is the revision the local edit was based on; a mismatch
    /// comes back as [`CommitOutcome::Conflict`].
    pub async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        mtime_utc: DateTime<Utc>,
        if_match: Option<&str>,
        cancel: &CancelToken,
    ) -> SyncResult<CommitOutcome> {
        let sha256 = sha256_hex(bytes);
        let mut op = match self.journaled(path, OperationKind::Upload)? {
            Some(mut op) if op.content_sha256.as_deref() == Some(sha256.as_str()) => {
                if op.status == OperationStatus::Error {
                    op.retry()?;
                }
                debug!(path, upload_id = ?op.upload_id, "resuming upload");
                op
            }
            _ => {
                let mut op = SyncOperation::start(OperationKind::Upload, path);
                op.content_sha256 = Some(sha256.clone());
                op
            }
        };
        let upload_id = match op.upload_id.clone() {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                op.upload_id = Some(id.clone());
                id
            }
        };
        self.store.put_operation(&self.thread_id, &op)?;

        let result = self
            .send_upload(&mut op, &upload_id, path, bytes, &sha256, mtime_utc, if_match, cancel)
            .await;
        self.finish(&mut op, &result)?;
        result
    }

    /// Deletes `path` remotely.
    pub async fn delete(
        &self,
        path: &str,
        if_match: Option<&str>,
        cancel: &CancelToken,
    ) -> SyncResult<DeleteOutcome> {
        let mut op = match self.journaled(path, OperationKind::Delete)? {
            Some(mut op) => {
                if op.status == OperationStatus::Error {
                    op.retry()?;
                }
                op
            }
            None => SyncOperation::start(OperationKind::Delete, path),
        };
        self.store.put_operation(&self.thread_id, &op)?;

        let key = format!("{}:delete", op.id);
        let result = match self.store.lookup_idempotency_outcome(&self.thread_id, &key)? {
            Some(entry) => {
                debug!(path, key, "delete already acknowledged");
                Ok(DeleteOutcome::Deleted {
                    revision_id: entry.outcome_revision_id,
                })
            }
            None => {
                let request = DeleteRequest {
                    thread_id: self.thread_id.clone(),
                    path: path.to_string(),
                    if_match_revision_id: if_match.map(str::to_string),
                    idempotency_key: key.clone(),
                };
                let outcome = self
                    .with_retry(path, Some(&mut op), cancel, || self.remote.delete(&request))
                    .await;
                if let Ok(DeleteOutcome::Deleted { revision_id }) = &outcome {
                    self.store.record_idempotency_outcome(
                        &self.thread_id,
                        IdempotencyEntry::new(key, IdempotentCall::Delete, revision_id.clone()),
                    )?;
                }
                outcome
            }
        };
        self.finish(&mut op, &result)?;
        result
    }

    /// Returns the resumable journaled operation of `kind` for `path`.
    fn journaled(&self, path: &str, kind: OperationKind) -> SyncResult<Option<SyncOperation>> {
        Ok(self
            .store
            .list_operations(&self.thread_id)?
            .into_iter()
            .find(|op| op.path == path && op.kind == kind && op.is_resumable()))
    }

    fn finish<T>(&self, op: &mut SyncOperation, result: &SyncResult<T>) -> SyncResult<()> {
        match result {
            Ok(_) => {
                op.succeed()?;
                self.store.remove_operation(&self.thread_id, &op.path)
            }
            // Left running; the next start treats it as interrupted.
            Err(SyncError::Cancelled) => Ok(()),
            Err(e) => {
                op.fail(e)?;
                self.store.put_operation(&self.thread_id, op)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_upload(
        &self,
        op: &mut SyncOperation,
        upload_id: &str,
        path: &str,
        bytes: &[u8],
        sha256: &str,
        mtime_utc: DateTime<Utc>,
        if_match: Option<&str>,
        cancel: &CancelToken,
    ) -> SyncResult<CommitOutcome> {
        let pieces: Vec<&[u8]> = if bytes.is_empty() {
            vec![bytes]
        } else {
            bytes.chunks(self.chunk_size).collect()
        };
        let total_chunks = u32::try_from(pieces.len())
            .map_err(|_| ProtocolError::invalid_field("totalChunks", "too many chunks"))?;

        for (chunk_index, piece) in (0..total_chunks).zip(pieces) {
            let key = chunk_idempotency_key(upload_id, chunk_index);
            if self
                .store
                .lookup_idempotency_outcome(&self.thread_id, &key)?
                .is_some()
            {
                debug!(path, key, "chunk already acknowledged");
                continue;
            }

            let chunk = ChunkUpload {
                upload_id: upload_id.to_string(),
                thread_id: self.thread_id.clone(),
                path: path.to_string(),
                chunk_index,
                total_chunks,
                chunk_sha256: sha256_hex(piece),
                bytes: piece.to_vec(),
            };
            let ack = self
                .with_retry(path, Some(&mut *op), cancel, || {
                    self.remote.upload_chunk(&chunk)
                })
                .await?;
            if ack.duplicate {
                debug!(path, key, "server already had chunk");
            }
            self.store.record_idempotency_outcome(
                &self.thread_id,
                IdempotencyEntry::new(key, IdempotentCall::Chunk, None),
            )?;
            self.bytes_uploaded
                .fetch_add(piece.len() as u64, Ordering::Relaxed);
        }

        let request = CommitRequest {
            upload_id: upload_id.to_string(),
            thread_id: self.thread_id.clone(),
            path: path.to_string(),
            final_sha256: sha256.to_string(),
            size: bytes.len() as u64,
            mtime_utc,
            if_match_revision_id: if_match.map(str::to_string),
        };
        let key = request.idempotency_key();
        if let Some(entry) = self.store.lookup_idempotency_outcome(&self.thread_id, &key)? {
            if let Some(revision_id) = entry.outcome_revision_id {
                debug!(path, key, "commit already acknowledged");
                return Ok(CommitOutcome::Committed { revision_id });
            }
        }

        let outcome = self
            .with_retry(path, Some(op), cancel, || self.remote.commit(&request))
            .await?;
        if let CommitOutcome::Committed { revision_id } = &outcome {
            self.store.record_idempotency_outcome(
                &self.thread_id,
                IdempotencyEntry::new(key, IdempotentCall::Commit, Some(revision_id.clone())),
            )?;
        }
        Ok(outcome)
    }

    /// Requests the missing suffix until the file is complete, then verifies.
    async fn fetch_remaining(
        &self,
        path: &str,
        remote: &RemoteFile,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<u8>> {
        loop {
            let offset = {
                let mut partials = self.partials.lock();
                let partial = partials
                    .entry(path.to_string())
                    .or_insert_with(|| PartialDownload::new(&remote.revision_id));
                if partial.revision_id != remote.revision_id {
                    *partial = PartialDownload::new(&remote.revision_id);
                }
                partial.bytes.len() as u64
            };
            if offset > 0 {
                debug!(path, offset, "resuming download");
            }

            let mut download = self
                .timed(self.remote.download(
                    &self.thread_id,
                    path,
                    Some(&remote.revision_id),
                    offset,
                ))
                .await?;
            let start = download.range.start;
            if start == 0 && offset > 0 {
                debug!(path, offset, "server ignored the range");
                self.append(path, remote, None);
            } else if start != offset {
                self.partials.lock().remove(path);
                return Err(ProtocolError::invalid_field(
                    "Content-Range",
                    format!("expected offset {offset}, got {start}"),
                )
                .into());
            }

            let mut received = 0u64;
            loop {
                cancel.check()?;
                let Some(piece) = self.timed(download.body.next_piece()).await? else {
                    break;
                };
                received += piece.len() as u64;
                self.bytes_downloaded
                    .fetch_add(piece.len() as u64, Ordering::Relaxed);
                self.append(path, remote, Some(&piece));
            }

            if download.range.is_complete(self.partial_len(path)) {
                break;
            }
            if received == 0 {
                return Err(SyncError::Network("download made no progress".into()));
            }
        }

        let bytes = self
            .partials
            .lock()
            .remove(path)
            .map(|p| p.bytes)
            .unwrap_or_default();
        let actual = sha256_hex(&bytes);
        if actual != remote.sha256 {
            return Err(SyncError::ChecksumMismatch {
                path: path.to_string(),
                expected: remote.sha256.clone(),
                actual,
            });
        }
        Ok(bytes)
    }

    /// Appends a received piece to the partial of `path`; `None` starts over.
    fn append(&self, path: &str, remote: &RemoteFile, piece: Option<&[u8]>) {
        let mut partials = self.partials.lock();
        let partial = partials
            .entry(path.to_string())
            .or_insert_with(|| PartialDownload::new(&remote.revision_id));
        match piece {
            Some(piece) => partial.bytes.extend_from_slice(piece),
            None => partial.bytes.clear(),
        }
    }

    /// Bounds one network step by the request timeout.
    async fn timed<T>(&self, step: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.request_timeout, step)
            .await
            .unwrap_or(Err(SyncError::Timeout))
    }

    /// Runs `call` under the request timeout, concurrency bound and retry
    /// policy.
    async fn with_retry<T, F, Fut>(
        &self,
        label: &str,
        op: Option<&mut SyncOperation>,
        cancel: &CancelToken,
        call: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.retry_loop(label, op, cancel, Some(self.request_timeout), call)
            .await
    }

    /// Retry loop shared by every call. `limit` bounds each attempt as a
    /// whole; streaming calls pass `None` and time their own steps.
    async fn retry_loop<T, F, Fut>(
        &self,
        label: &str,
        mut op: Option<&mut SyncOperation>,
        cancel: &CancelToken,
        limit: Option<Duration>,
        mut call: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempts = 0;
        loop {
            cancel.check()?;
            attempts += 1;

            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| SyncError::Cancelled)?;
                let attempt = async {
                    match limit {
                        Some(limit) => tokio::time::timeout(limit, call())
                            .await
                            .unwrap_or(Err(SyncError::Timeout)),
                        None => call().await,
                    }
                };
                tokio::select! {
                    r = attempt => r,
                    _ = cancel.cancelled() => Err(SyncError::Cancelled),
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempts) => {
                    let delay = self.retry.delay_with_hint(attempts, e.retry_after());
                    warn!(
                        path = label,
                        attempt = attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; retrying"
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    if let Some(op) = op.as_deref_mut() {
                        op.fail(&e)?;
                        op.retry()?;
                        self.store.put_operation(&self.thread_id, op)?;
                    }
                    cancel.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
