//! Engine façade.
//!
//! [`SyncEngine`] wires the store, workspace, transfer engine, conflict
//! resolver and reconciler for one thread and enforces one pass at a time.
//! Triggers that arrive while a pass runs are coalesced into a single
//! follow-up pass. A coalesced trigger survives a failed pass unless the
//! failure was a cancellation or fatal, in which case it is dropped with the
//! error.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::{SyncError, SyncResult};
use crate::feed::{PassRequester, TriggerReason};
use crate::model::{ConflictRecord, LastError, Resolution};
use crate::reconciler::{PassReport, Reconciler};
use crate::store::StateStore;
use crate::transfer::{TransferEngine, TransferStats};
use crate::transport::RemoteStore;
use crate::workspace::WorkspaceProvider;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadsync_protocol::SyncCursor;
use tracing::{debug, info, warn};

/// Follow-up passes run when a push met a newer remote revision.
const MAX_FOLLOW_UPS: u32 = 1;

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No pass has run yet.
    Idle,
    /// A pass is running.
    Syncing,
    /// The last pass completed.
    Synced,
    /// The last pass failed.
    Error,
}

impl SyncState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }
}

/// Totals across passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Passes completed.
    pub passes_completed: u64,
    /// Passes that failed.
    pub passes_failed: u64,
    /// Triggers folded into a running pass.
    pub triggers_coalesced: u64,
    /// Files downloaded.
    pub files_downloaded: u64,
    /// Files uploaded.
    pub files_uploaded: u64,
    /// Conflicts parked.
    pub conflicts_detected: u64,
    /// End of the last completed pass.
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncStats {
    fn record(&mut self, report: &PassReport) {
        self.passes_completed += 1;
        self.files_downloaded += u64::from(report.downloaded);
        self.files_uploaded += u64::from(report.uploaded);
        self.conflicts_detected += u64::from(report.conflicts);
        self.last_sync_time = Some(Utc::now());
    }
}

/// Result of [`SyncEngine::sync_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// This call ran the pass (and any follow-ups); the report is the last one.
    Completed(PassReport),
    /// Another pass was running; it will run once more to cover this trigger.
    Coalesced,
}

/// Snapshot for status displays.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Thread id.
    pub thread_id: String,
    /// Engine state.
    pub state: SyncState,
    /// Last applied manifest cursor.
    pub cursor: Option<SyncCursor>,
    /// Error kept from the last failed pass.
    pub last_error: Option<LastError>,
    /// Conflicts waiting for the user.
    pub unresolved_conflicts: usize,
    /// Journaled transfers.
    pub pending_operations: usize,
    /// Pass totals.
    pub stats: SyncStats,
    /// Transfer totals.
    pub transfers: TransferStats,
}

/// Sync engine for one thread.
pub struct SyncEngine<R: RemoteStore, S: StateStore, W: WorkspaceProvider> {
    config: SyncConfig,
    store: Arc<S>,
    transfer: Arc<TransferEngine<R, S>>,
    resolver: Arc<ConflictResolver<S, W>>,
    reconciler: Reconciler<R, S, W>,
    pass_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    cancel: CancelToken,
    state: Mutex<SyncState>,
    stats: Mutex<SyncStats>,
}

impl<R, S, W> SyncEngine<R, S, W>
where
    R: RemoteStore + 'static,
    S: StateStore + 'static,
    W: WorkspaceProvider + 'static,
{
    /// Creates an engine and recovers transfers interrupted by a previous
    /// process.
    pub fn new(config: SyncConfig, remote: Arc<R>, store: Arc<S>, workspace: Arc<W>) -> SyncResult<Self> {
        let transfer = Arc::new(TransferEngine::new(&config, remote, Arc::clone(&store)));
        transfer.recover_journal()?;
        let resolver = Arc::new(ConflictResolver::new(
            config.thread_id.clone(),
            config.device_id.clone(),
            Arc::clone(&store),
            Arc::clone(&workspace),
        ));
        let reconciler = Reconciler::new(
            &config,
            Arc::clone(&store),
            workspace,
            Arc::clone(&transfer),
            Arc::clone(&resolver),
        );
        Ok(Self {
            config,
            store,
            transfer,
            resolver,
            reconciler,
            pass_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            cancel: CancelToken::new(),
            state: Mutex::new(SyncState::Idle),
            stats: Mutex::new(SyncStats::default()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Returns pass totals.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Runs a pass now, or folds the request into the running one.
    pub async fn sync_now(&self) -> SyncResult<PassOutcome> {
        let mut completed = None;
        loop {
            let guard = match self.pass_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.rerun.store(true, Ordering::SeqCst);
                    // The running pass may have checked the flag just before
                    // we set it.
                    match self.pass_lock.try_lock() {
                        Ok(guard) => guard,
                        Err(_) => {
                            if completed.is_none() {
                                self.stats.lock().triggers_coalesced += 1;
                                debug!(thread = %self.config.thread_id, "pass already running; trigger coalesced");
                            }
                            return Ok(completed.map_or(PassOutcome::Coalesced, PassOutcome::Completed));
                        }
                    }
                }
            };
            self.cancel.reset();

            let mut follow_ups = 0;
            let failure = loop {
                self.rerun.store(false, Ordering::SeqCst);
                match self.run_pass().await {
                    Ok(report) => {
                        let follow_up = report.follow_up && follow_ups < MAX_FOLLOW_UPS;
                        completed = Some(report);
                        if follow_up {
                            follow_ups += 1;
                            debug!(thread = %self.config.thread_id, "running follow-up pass");
                            continue;
                        }
                        if !self.rerun.load(Ordering::SeqCst) {
                            break None;
                        }
                        debug!(thread = %self.config.thread_id, "trigger arrived during pass; running again");
                    }
                    Err(e) if !e.is_fatal()
                        && !matches!(e, SyncError::Cancelled)
                        && self.rerun.load(Ordering::SeqCst) =>
                    {
                        debug!(
                            thread = %self.config.thread_id,
                            error = %e,
                            "pass failed with a trigger pending; running again"
                        );
                    }
                    Err(e) => {
                        // Pending triggers go down with the pass.
                        self.rerun.store(false, Ordering::SeqCst);
                        break Some(e);
                    }
                }
            };
            drop(guard);
            if let Some(e) = failure {
                return Err(e);
            }

            if !self.rerun.load(Ordering::SeqCst) {
                return Ok(completed.map_or(PassOutcome::Coalesced, PassOutcome::Completed));
            }
        }
    }

    async fn run_pass(&self) -> SyncResult<PassReport> {
        *self.state.lock() = SyncState::Syncing;
        let result = self.reconciler.run_pass(&self.cancel).await;
        let state = match &result {
            Ok(report) => {
                self.stats.lock().record(report);
                SyncState::Synced
            }
            Err(SyncError::Cancelled) => SyncState::Idle,
            Err(_) => {
                self.stats.lock().passes_failed += 1;
                SyncState::Error
            }
        };
        *self.state.lock() = state;
        result
    }

    /// Stops the running pass at its next request boundary.
    pub fn cancel(&self) {
        info!(thread = %self.config.thread_id, "cancelling sync");
        self.cancel.cancel();
    }

    /// Unresolved conflicts.
    pub fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self
            .store
            .list_conflicts(&self.config.thread_id)?
            .into_iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .collect())
    }

    /// Applies a user decision to a conflict. Waits for a running pass.
    ///
    /// `target` is the parked copy, or the original path when only one copy
    /// is parked for it.
    pub async fn resolve_conflict(&self, target: &str, resolution: Resolution) -> SyncResult<()> {
        let _guard = self.pass_lock.lock().await;
        self.cancel.reset();
        self.resolver
            .resolve(target, resolution, &self.transfer, &self.cancel)
            .await
    }

    /// Returns a status snapshot.
    pub fn status(&self) -> SyncResult<EngineStatus> {
        let thread_id = self.config.thread_id.as_str();
        Ok(EngineStatus {
            thread_id: thread_id.to_string(),
            state: self.state(),
            cursor: self.store.get_cursor(thread_id)?,
            last_error: self.store.last_error(thread_id)?,
            unresolved_conflicts: self.conflicts()?.len(),
            pending_operations: self.store.list_operations(thread_id)?.len(),
            stats: self.stats(),
            transfers: self.transfer.stats(),
        })
    }
}

/// Turns pass requests into background [`SyncEngine::sync_now`] calls.
pub struct SyncScheduler<R: RemoteStore, S: StateStore, W: WorkspaceProvider> {
    engine: Arc<SyncEngine<R, S, W>>,
}

impl<R, S, W> SyncScheduler<R, S, W>
where
    R: RemoteStore + 'static,
    S: StateStore + 'static,
    W: WorkspaceProvider + 'static,
{
    /// Creates a scheduler for `engine`.
    pub fn new(engine: Arc<SyncEngine<R, S, W>>) -> Self {
        Self { engine }
    }

    /// Requests a pass every `period` until `stop` is cancelled.
    pub async fn run_interval(&self, period: Duration, stop: &CancelToken) {
        while stop.sleep(period).await.is_ok() {
            self.request_pass(TriggerReason::Interval);
        }
    }
}

impl<R, S, W> PassRequester for SyncScheduler<R, S, W>
where
    R: RemoteStore + 'static,
    S: StateStore + 'static,
    W: WorkspaceProvider + 'static,
{
    fn request_pass(&self, reason: TriggerReason) {
        let engine = Arc::clone(&self.engine);
        debug!(thread = %engine.config.thread_id, ?reason, "pass requested");
        tokio::spawn(async move {
            match engine.sync_now().await {
                Ok(PassOutcome::Completed(report)) => {
                    debug!(changes = report.changes(), "triggered pass finished");
                }
                Ok(PassOutcome::Coalesced) => {}
                Err(e) => warn!(error = %e, "triggered pass failed"),
            }
        });
    }
}
