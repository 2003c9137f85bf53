//! Conflict detection, parking and resolution through the engine.

use threadsync_engine::{PassOutcome, PassReport, Resolution, SyncError};
use threadsync_protocol::ManifestPage;
use threadsync_testkit::prelude::*;

fn completed(outcome: PassOutcome) -> PassReport {
    match outcome {
        PassOutcome::Completed(report) => report,
        PassOutcome::Coalesced => panic!("expected a completed pass"),
    }
}

/// Syncs `a.txt`, then edits it on both sides.
async fn concurrent_edit(harness: &TestHarness, engine: &TestEngine) -> PassReport {
    harness.remote.put_file("a.txt", "v1");
    engine.sync_now().await.unwrap();

    harness.write_local("a.txt", "local edit");
    harness.remote.put_file("a.txt", "remote edit");
    completed(engine.sync_now().await.unwrap())
}

#[tokio::test]
async fn concurrent_edit_parks_local_copy() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let report = concurrent_edit(&harness, &engine).await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 0);
    assert!(!report.follow_up);

    let conflicts = engine.conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.path, "a.txt");
    assert!(conflict.conflict_path.starts_with("a (conflict test-device "));
    assert!(conflict.conflict_path.ends_with(").txt"));
    assert_eq!(conflict.local_revision.as_deref(), Some("rev-1"));
    assert_eq!(conflict.remote_revision.as_deref(), Some("rev-2"));
    assert_eq!(conflict.resolution, Resolution::Unresolved);

    assert_eq!(harness.read_local("a.txt").unwrap(), b"remote edit");
    assert_eq!(
        harness.read_local(&conflict.conflict_path).unwrap(),
        b"local edit"
    );
    assert_eq!(harness.remote.content("a.txt").unwrap(), b"remote edit");
    assert_eq!(harness.local_files().len(), 2);
    assert_eq!(engine.status().unwrap().unresolved_conflicts, 1);
}

#[tokio::test]
async fn parked_copy_is_not_uploaded_while_unresolved() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;

    harness.remote.reset_calls();
    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.changes(), 0);
    assert_eq!(harness.remote.calls().transfers(), 0);
    assert_eq!(harness.remote.files(), vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn pick_local_uploads_parked_copy() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;

    engine
        .resolve_conflict("a.txt", Resolution::PickLocal)
        .await
        .unwrap();

    assert_eq!(harness.remote.content("a.txt").unwrap(), b"local edit");
    assert_eq!(harness.read_local("a.txt").unwrap(), b"local edit");
    assert_eq!(harness.local_files(), vec!["a.txt"]);
    assert!(engine.conflicts().unwrap().is_empty());
    harness.assert_mirrors_remote();

    harness.remote.reset_calls();
    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.changes(), 0);
    assert_eq!(harness.remote.calls().transfers(), 0);
}

#[tokio::test]
async fn pick_remote_discards_parked_copy() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;

    engine
        .resolve_conflict("a.txt", Resolution::PickRemote)
        .await
        .unwrap();

    assert_eq!(harness.local_files(), vec!["a.txt"]);
    assert_eq!(harness.read_local("a.txt").unwrap(), b"remote edit");
    assert!(engine.conflicts().unwrap().is_empty());

    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.uploaded, 0);
    assert_eq!(harness.remote.files(), vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn keep_both_uploads_parked_copy_as_new_file() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;
    let conflict_path = engine.conflicts().unwrap()[0].conflict_path.clone();

    engine
        .resolve_conflict("a.txt", Resolution::KeepBoth)
        .await
        .unwrap();
    assert_eq!(harness.local_files().len(), 2);

    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        harness.remote.content(&conflict_path).unwrap(),
        b"local edit"
    );
    assert_eq!(harness.remote.content("a.txt").unwrap(), b"remote edit");
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn resolving_twice_is_rejected() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;

    engine
        .resolve_conflict("a.txt", Resolution::PickRemote)
        .await
        .unwrap();
    let err = engine
        .resolve_conflict("a.txt", Resolution::PickRemote)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConflictNotFound(path) if path == "a.txt"));
}

#[tokio::test]
async fn pick_local_against_newer_remote_keeps_conflict() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;
    harness.remote.put_file("a.txt", "third edit");

    let err = engine
        .resolve_conflict("a.txt", Resolution::PickLocal)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::PreconditionFailed { .. }));
    assert_eq!(engine.conflicts().unwrap().len(), 1);
    assert_eq!(harness.remote.content("a.txt").unwrap(), b"third edit");
}

#[tokio::test]
async fn rejected_commit_parks_and_runs_follow_up() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    harness.remote.put_file("a.txt", "v1");
    engine.sync_now().await.unwrap();

    // The pull does not see the remote edit; the push does.
    harness.write_local("a.txt", "local edit");
    harness.remote.put_file("a.txt", "remote edit");
    harness
        .remote
        .push_page(ManifestPage::new(Vec::new(), None, false));

    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.downloaded, 1);

    let stats = engine.stats();
    assert_eq!(stats.passes_completed, 3);
    assert_eq!(stats.conflicts_detected, 1);

    let conflicts = engine.conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].remote_revision.as_deref(), Some("rev-2"));
    assert_eq!(harness.read_local("a.txt").unwrap(), b"remote edit");
    assert_eq!(
        harness.read_local(&conflicts[0].conflict_path).unwrap(),
        b"local edit"
    );
    assert_eq!(engine.status().unwrap().pending_operations, 0);
}

#[tokio::test]
async fn remote_deletion_of_edited_file_parks_copy() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    harness.remote.put_file("a.txt", "v1");
    engine.sync_now().await.unwrap();

    harness.write_local("a.txt", "local edit");
    harness.remote.remove_file("a.txt");
    let report = completed(engine.sync_now().await.unwrap());

    assert_eq!(report.conflicts, 1);
    assert!(harness.read_local("a.txt").is_none());
    assert!(harness.record("a.txt").is_none());

    let conflict = engine.conflicts().unwrap().remove(0);
    assert!(conflict.remote_revision.is_none());
    assert_eq!(
        harness.read_local(&conflict.conflict_path).unwrap(),
        b"local edit"
    );

    engine
        .resolve_conflict("a.txt", Resolution::PickLocal)
        .await
        .unwrap();
    assert_eq!(harness.remote.content("a.txt").unwrap(), b"local edit");
    assert_eq!(harness.local_files(), vec!["a.txt"]);
}

#[tokio::test]
async fn second_conflict_on_same_path_keeps_both_copies() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;
    let first = engine.conflicts().unwrap().remove(0);

    harness.write_local("a.txt", "second local edit");
    harness.remote.put_file("a.txt", "second remote edit");
    let report = completed(engine.sync_now().await.unwrap());
    assert_eq!(report.conflicts, 1);

    let conflicts = engine.conflicts().unwrap();
    assert_eq!(conflicts.len(), 2);
    let second = conflicts
        .iter()
        .find(|c| c.conflict_path != first.conflict_path)
        .unwrap()
        .clone();
    assert_eq!(second.path, "a.txt");
    assert!(conflicts.contains(&first));
    assert_eq!(
        harness.read_local(&first.conflict_path).unwrap(),
        b"local edit"
    );
    assert_eq!(
        harness.read_local(&second.conflict_path).unwrap(),
        b"second local edit"
    );

    // Neither parked copy leaves the device while unresolved.
    completed(engine.sync_now().await.unwrap());
    assert_eq!(harness.remote.files(), vec!["a.txt".to_string()]);

    let err = engine
        .resolve_conflict("a.txt", Resolution::PickRemote)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::AmbiguousConflict { ref parked, .. } if parked.len() == 2
    ));

    engine
        .resolve_conflict(&second.conflict_path, Resolution::PickLocal)
        .await
        .unwrap();
    assert_eq!(
        harness.remote.content("a.txt").unwrap(),
        b"second local edit"
    );
    engine
        .resolve_conflict("a.txt", Resolution::PickRemote)
        .await
        .unwrap();

    assert!(engine.conflicts().unwrap().is_empty());
    assert_eq!(harness.local_files(), vec!["a.txt"]);
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn resolution_works_after_a_cancelled_sync() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    concurrent_edit(&harness, &engine).await;

    engine.cancel();
    engine
        .resolve_conflict("a.txt", Resolution::PickLocal)
        .await
        .unwrap();

    assert_eq!(harness.remote.content("a.txt").unwrap(), b"local edit");
    assert!(engine.conflicts().unwrap().is_empty());
}
