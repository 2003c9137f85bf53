//! Crash recovery and on-disk state durability.

use std::fs;
use std::sync::Arc;

use threadsync_engine::{
    Fault, FaultTarget, FileStateStore, OperationKind, OperationStatus, PassOutcome, StateStore,
    SyncEngine, SyncError, SyncOperation,
};
use threadsync_testkit::prelude::*;

#[tokio::test]
async fn restart_resumes_from_stored_cursor() {
    let mut harness = TestHarness::new();
    for (path, content) in [("a.txt", "alpha"), ("b.txt", "beta"), ("c.txt", "gamma")] {
        harness.remote.put_file(path, content);
    }
    harness
        .remote
        .fail_next_for(FaultTarget::Download, "c.txt", Fault::Network);

    {
        let engine = harness.engine();
        assert!(engine.sync_now().await.is_err());
    }
    assert_eq!(harness.cursor().as_deref(), Some("cursor-2"));

    harness.restart();
    assert_eq!(harness.cursor().as_deref(), Some("cursor-2"));
    harness.remote.reset_calls();

    let engine = harness.engine();
    let PassOutcome::Completed(report) = engine.sync_now().await.unwrap() else {
        panic!("expected a completed pass");
    };
    assert_eq!(report.downloaded, 1);

    let calls = harness.remote.calls();
    assert_eq!(calls.manifest_cursors[0].as_deref(), Some("cursor-2"));
    assert_eq!(calls.downloads, vec![("c.txt".to_string(), 0)]);
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn failed_commit_resumes_upload_after_restart() {
    let mut harness = TestHarness::new();
    harness.write_local("big.txt", "0123456789");
    harness
        .remote
        .fail_next(FaultTarget::Commit, Fault::Status(503));

    {
        let engine = harness.engine();
        let err = engine.sync_now().await.unwrap_err();
        assert_eq!(err.path(), Some("big.txt"));
    }
    assert_eq!(harness.remote.calls().chunks_stored, 3);

    let journaled = harness.state().operations;
    let op = journaled.get("big.txt").expect("upload journaled");
    assert_eq!(op.kind, OperationKind::Upload);
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.retryable);

    harness.restart();
    harness.remote.reset_calls();
    let engine = harness.engine();
    engine.sync_now().await.unwrap();

    let calls = harness.remote.calls();
    assert_eq!(calls.chunk_requests, 0);
    assert_eq!(calls.commits, 1);
    assert_eq!(harness.remote.content("big.txt").unwrap(), b"0123456789");
    assert!(harness.state().operations.is_empty());
}

#[tokio::test]
async fn running_operation_is_journaled_as_interrupted() {
    let harness = TestHarness::new();
    harness
        .store
        .put_operation(
            TEST_THREAD,
            &SyncOperation::start(OperationKind::Download, "a.txt"),
        )
        .unwrap();

    let engine = harness.engine();
    let op = harness.state().operations.remove("a.txt").unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.retryable);
    assert_eq!(op.detail.as_deref(), Some("interrupted"));
    assert_eq!(engine.status().unwrap().pending_operations, 1);

    harness.remote.put_file("a.txt", "alpha");
    engine.sync_now().await.unwrap();
    assert_eq!(engine.status().unwrap().pending_operations, 0);
    assert_eq!(harness.read_local("a.txt").unwrap(), b"alpha");
}

#[tokio::test]
async fn corrupt_state_is_refused_and_left_in_place() {
    let harness = TestHarness::new();
    let thread_state = harness.state_dir().join(TEST_THREAD);
    fs::create_dir_all(&thread_state).unwrap();
    fs::write(thread_state.join("state.json"), b"{ not json").unwrap();

    let err = SyncEngine::new(
        harness.config().clone(),
        harness.remote.clone(),
        harness.store.clone(),
        harness.workspace.clone(),
    )
    .err()
    .expect("corrupt state must be refused");
    assert!(matches!(err, SyncError::StoreUnavailable(_)));
    assert!(err.is_fatal());
    assert_eq!(
        fs::read(thread_state.join("state.json")).unwrap(),
        b"{ not json"
    );
}

#[tokio::test]
async fn second_store_on_same_thread_is_locked_out() {
    let harness = TestHarness::new();
    let _engine = harness.engine();

    let other = std::sync::Arc::new(FileStateStore::open(harness.state_dir()).unwrap());
    let err = other.get_cursor(TEST_THREAD).unwrap_err();
    assert!(matches!(err, SyncError::StoreUnavailable(message) if message.contains("locked")));
}

#[tokio::test]
async fn records_survive_restart() {
    let mut harness = TestHarness::new();
    harness.remote.put_file("docs/readme.md", "hello");
    harness.engine().sync_now().await.unwrap();
    let before = harness.record("docs/readme.md").unwrap();

    harness.restart();
    assert_eq!(harness.record("docs/readme.md").unwrap(), before);

    harness.remote.reset_calls();
    harness.engine().sync_now().await.unwrap();
    assert_eq!(harness.remote.calls().transfers(), 0);
}

#[tokio::test]
async fn cancel_mid_page_keeps_committed_prefix() {
    let harness = TestHarness::with_config(|config| {
        config.with_page_limit(3).with_max_concurrent_transfers(1)
    });
    for (path, content) in [("a.txt", "alpha"), ("b.txt", "beta"), ("c.txt", "gamma")] {
        harness.remote.put_file(path, content);
    }
    let engine = harness.shared_engine();
    let cancelling = Arc::clone(&engine);
    harness
        .remote
        .on_next_call(FaultTarget::Download, "b.txt", move || cancelling.cancel());

    let err = engine.sync_now().await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));

    // Item 1 is committed; items 2 and 3 left no trace.
    assert_eq!(harness.cursor().as_deref(), Some("cursor-1"));
    assert!(harness.record("a.txt").is_some());
    assert!(harness.record("b.txt").is_none());
    assert!(harness.record("c.txt").is_none());
    assert_eq!(harness.local_files(), vec!["a.txt"]);
    assert!(harness
        .remote
        .calls()
        .downloads
        .iter()
        .all(|(path, _)| path != "c.txt"));

    harness.remote.reset_calls();
    let PassOutcome::Completed(report) = engine.sync_now().await.unwrap() else {
        panic!("expected a completed pass");
    };
    assert_eq!(report.downloaded, 2);
    assert_eq!(
        harness.remote.calls().manifest_cursors[0].as_deref(),
        Some("cursor-1")
    );
    harness.assert_mirrors_remote();
}
