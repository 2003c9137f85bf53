//! End-to-end reconciliation scenarios against the in-memory remote.

use std::sync::Arc;

use threadsync_engine::{
    Fault, FaultTarget, LocalWorkspace, MemoryRemote, MemoryStateStore, PassOutcome, PassReport,
    StateStore, SyncEngine, SyncError, SyncState,
};
use threadsync_protocol::{ManifestEntry, ManifestPage, RemoteFile, SyncCursor};
use threadsync_testkit::prelude::*;

fn completed(outcome: PassOutcome) -> PassReport {
    match outcome {
        PassOutcome::Completed(report) => report,
        PassOutcome::Coalesced => panic!("expected a completed pass"),
    }
}

fn cursor(token: &str) -> SyncCursor {
    SyncCursor::parse(token).unwrap()
}

#[tokio::test]
async fn two_items_end_at_last_cursor() {
    let harness = TestHarness::new();
    harness.remote.put_file("a.txt", "alpha");
    harness.remote.put_file("b.txt", "beta");

    let report = completed(harness.engine().sync_now().await.unwrap());
    assert_eq!(report.downloaded, 2);
    assert_eq!(report.pages, 1);
    assert_eq!(harness.cursor().as_deref(), Some("cursor-2"));
    assert_eq!(harness.local_files(), vec!["a.txt", "b.txt"]);
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn failed_second_item_keeps_first_cursor() {
    let harness = TestHarness::new();
    harness.remote.put_file("a.txt", "alpha");
    harness.remote.put_file("b.txt", "beta");
    harness
        .remote
        .fail_next_for(FaultTarget::Download, "b.txt", Fault::Status(503));

    let engine = harness.engine();
    let err = engine.sync_now().await.unwrap_err();
    assert_eq!(err.path(), Some("b.txt"));
    assert!(err.is_retryable());
    assert_eq!(engine.state(), SyncState::Error);
    assert_eq!(harness.cursor().as_deref(), Some("cursor-1"));
    assert_eq!(harness.read_local("a.txt").unwrap(), b"alpha");
    assert!(harness.read_local("b.txt").is_none());
    assert!(harness.record("b.txt").is_none());

    harness.remote.reset_calls();
    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.downloaded, 1);

    let calls = harness.remote.calls();
    assert_eq!(calls.manifest_cursors[0].as_deref(), Some("cursor-1"));
    assert_eq!(calls.downloads, vec![("b.txt".to_string(), 0)]);
    assert_eq!(harness.cursor().as_deref(), Some("cursor-2"));
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn tombstone_deletes_without_download() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    harness.remote.put_file("a.txt", "alpha");
    engine.sync_now().await.unwrap();

    harness.remote.remove_file("a.txt");
    harness.remote.reset_calls();
    let report = completed(engine.sync_now().await.unwrap());

    assert_eq!(report.deleted, 1);
    assert!(harness.read_local("a.txt").is_none());
    assert!(harness.record("a.txt").is_none());
    assert!(harness.remote.calls().downloads.is_empty());
    assert_eq!(harness.cursor().as_deref(), Some("cursor-2"));
}

#[tokio::test]
async fn rerun_after_completed_pass_transfers_nothing() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    for (path, content) in [("a.txt", "1"), ("docs/b.md", "22"), ("docs/c.md", "333")] {
        harness.remote.put_file(path, content);
    }
    let first = completed(engine.sync_now().await.unwrap());
    assert_eq!(first.downloaded, 3);
    assert_eq!(first.pages, 2);

    harness.remote.reset_calls();
    let second = completed(engine.sync_now().await.unwrap());
    assert_eq!(second.changes(), 0);
    assert_eq!(harness.remote.calls().transfers(), 0);
    assert_eq!(harness.cursor().as_deref(), Some("cursor-3"));
}

#[tokio::test]
async fn stalled_manifest_leaves_state_unchanged() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    harness.remote.put_file("a.txt", "alpha");
    engine.sync_now().await.unwrap();
    let before = harness.state();

    harness.remote.push_page(ManifestPage::new(
        vec![ManifestEntry::tombstone("a.txt", cursor("cursor-9"))],
        Some(cursor("cursor-1")),
        true,
    ));
    let err = engine.sync_now().await.unwrap_err();

    assert!(matches!(err, SyncError::CursorStall { .. }));
    assert!(err.is_fatal());
    assert_eq!(engine.state(), SyncState::Error);
    assert_eq!(harness.read_local("a.txt").unwrap(), b"alpha");

    let after = harness.state();
    assert_eq!(after.cursor, before.cursor);
    assert_eq!(after.files, before.files);
    assert!(after.last_error.is_some());
}

#[tokio::test]
async fn local_creation_is_uploaded_in_chunks() {
    let harness = TestHarness::new();
    harness.write_local("notes/todo.txt", "0123456789");

    let report = completed(harness.engine().sync_now().await.unwrap());
    assert_eq!(report.uploaded, 1);

    let calls = harness.remote.calls();
    assert_eq!(calls.chunks_stored, 3);
    assert_eq!(calls.commits, 1);
    assert_eq!(harness.remote.content("notes/todo.txt").unwrap(), b"0123456789");
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn empty_files_are_mirrored_both_ways() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    harness.remote.put_file("remote-empty.txt", Vec::new());
    harness.write_local("local-empty.txt", "");

    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(harness.read_local("remote-empty.txt").unwrap(), b"");
    assert_eq!(harness.remote.content("local-empty.txt").unwrap(), b"");
    assert_eq!(harness.remote.calls().chunks_stored, 1);
}

#[tokio::test]
async fn rename_is_pushed_as_delete_then_create() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    harness.remote.put_file("old.txt", "content");
    engine.sync_now().await.unwrap();

    std::fs::rename(harness.local_path("old.txt"), harness.local_path("new.txt")).unwrap();
    let report = completed(engine.sync_now().await.unwrap());

    assert_eq!(report.remote_deleted, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(harness.remote.files(), vec!["new.txt".to_string()]);
    assert!(harness.record("old.txt").is_none());
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn traversal_path_is_rejected_before_touching_disk() {
    let harness = TestHarness::new();
    harness.remote.push_page(ManifestPage::new(
        vec![ManifestEntry::upsert(
            "../escape.txt",
            cursor("cursor-1"),
            RemoteFile {
                revision_id: "rev-1".into(),
                sha256: threadsync_protocol::sha256_hex(b"x"),
                size: Some(1),
                mtime_utc: None,
            },
        )],
        Some(cursor("cursor-1")),
        false,
    ));

    let err = harness.engine().sync_now().await.unwrap_err();
    match err {
        SyncError::ItemFailed { path, source } => {
            assert_eq!(path, "../escape.txt");
            assert!(matches!(*source, SyncError::InvalidPath(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.cursor().is_none());
    let outside = harness.thread_dir().parent().unwrap().join("escape.txt");
    assert!(!outside.exists());
}

#[tokio::test]
async fn push_disabled_only_pulls() {
    let harness = TestHarness::with_config(|config| config.with_push(false));
    harness.remote.put_file("a.txt", "alpha");
    harness.write_local("mine.txt", "local only");

    let report = completed(harness.engine().sync_now().await.unwrap());
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(harness.remote.files(), vec!["a.txt".to_string()]);
    assert_eq!(harness.read_local("mine.txt").unwrap(), b"local only");
}

#[tokio::test]
async fn transient_faults_are_retried_within_a_pass() {
    let harness = TestHarness::with_config(|config| {
        config.with_retry(threadsync_engine::RetryPolicy::immediate(4))
    });
    harness.remote.put_file("a.txt", "alpha");
    harness.write_local("b.txt", "bravo");
    FaultPlan::new()
        .fail(FaultTarget::Manifest, Fault::Timeout)
        .fail_for(FaultTarget::Download, "a.txt", Fault::Interrupt { after: 2 })
        .fail(FaultTarget::Chunk, Fault::LostResponse)
        .fail(FaultTarget::Commit, Fault::Status(503))
        .arm(&harness.remote);

    let engine = harness.engine();
    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 1);
    harness.assert_mirrors_remote();

    let status = engine.status().unwrap();
    assert!(status.transfers.retries >= 3);
    assert_eq!(status.pending_operations, 0);
}

#[tokio::test]
async fn store_unavailable_aborts_pass() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new(TEST_THREAD));
    let store = Arc::new(MemoryStateStore::new());
    let config = test_config()
        .with_page_limit(3)
        .with_max_concurrent_transfers(1);
    let engine = SyncEngine::new(
        config,
        Arc::clone(&remote),
        Arc::clone(&store),
        Arc::new(LocalWorkspace::new(dir.path())),
    )
    .unwrap();
    for (path, content) in [("a.txt", "alpha"), ("b.txt", "beta"), ("c.txt", "gamma")] {
        remote.put_file(path, content);
    }
    let failing = Arc::clone(&store);
    remote.on_next_call(FaultTarget::Download, "b.txt", move || {
        failing.set_unavailable(true)
    });

    let err = engine.sync_now().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.path(), Some("b.txt"));
    assert!(matches!(
        err,
        SyncError::ItemFailed { ref source, .. }
            if matches!(**source, SyncError::StoreUnavailable(_))
    ));
    assert_eq!(engine.state(), SyncState::Error);
    let downloaded: Vec<String> = remote
        .calls()
        .downloads
        .into_iter()
        .map(|(path, _)| path)
        .collect();
    assert_eq!(downloaded, vec!["a.txt", "b.txt"]);

    // A pass against an unavailable store does not reach the server.
    remote.reset_calls();
    assert!(matches!(
        engine.sync_now().await,
        Err(SyncError::StoreUnavailable(_))
    ));
    assert!(remote.calls().manifest_cursors.is_empty());

    store.set_unavailable(false);
    assert_eq!(
        store.get_cursor(TEST_THREAD).unwrap().unwrap().as_str(),
        "cursor-1"
    );
    let records: Vec<String> = store
        .list_file_records(TEST_THREAD)
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(records, vec!["a.txt"]);
}
