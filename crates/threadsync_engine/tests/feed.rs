//! Change feed and scheduler driving real passes.

use std::sync::Arc;
use std::time::Duration;

use threadsync_engine::{
    CancelToken, ChangeFeedListener, FeedConfig, FeedScript, MemoryFeed, RetryPolicy,
    SyncScheduler,
};
use threadsync_protocol::{EventId, FeedEvent, FeedEventKind, FeedMessage};
use threadsync_testkit::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn changed(id: &str, thread: &str, path: &str) -> FeedMessage {
    FeedMessage::Event(FeedEvent {
        kind: FeedEventKind::FileChanged,
        id: Some(EventId::parse(id).unwrap()),
        cursor: None,
        thread_id: Some(thread.to_string()),
        path: Some(path.to_string()),
        revision_id: None,
        updated_at: None,
    })
}

fn feed_config() -> FeedConfig {
    FeedConfig::default().with_reconnect(RetryPolicy::immediate(u32::MAX))
}

#[tokio::test]
async fn feed_event_runs_a_pass() {
    let harness = TestHarness::new();
    let engine = harness.shared_engine();
    let scheduler = Arc::new(SyncScheduler::new(Arc::clone(&engine)));
    harness.remote.put_file("a.txt", "alpha");

    let feed = Arc::new(MemoryFeed::new([FeedScript::Stream(vec![changed(
        "evt-1",
        TEST_THREAD,
        "a.txt",
    )])]));
    let listener = ChangeFeedListener::new(TEST_THREAD, feed.clone(), scheduler, feed_config());

    let watch = async {
        let synced = eventually(WAIT, || engine.stats().passes_completed >= 1).await;
        listener.stop();
        synced
    };
    let (result, synced) = tokio::join!(listener.run(), watch);
    result.unwrap();

    assert!(synced);
    assert_eq!(harness.read_local("a.txt").unwrap(), b"alpha");
    assert_eq!(listener.last_event_id().unwrap().as_str(), "evt-1");
    assert_eq!(feed.subscriptions()[0], None);
}

#[tokio::test]
async fn feed_gap_runs_a_full_pass() {
    let harness = TestHarness::new();
    let engine = harness.shared_engine();
    let scheduler = Arc::new(SyncScheduler::new(Arc::clone(&engine)));
    harness.remote.put_file("a.txt", "alpha");
    harness.remote.put_file("b.txt", "beta");

    let feed = Arc::new(MemoryFeed::new([FeedScript::Gap]));
    let listener = ChangeFeedListener::new(TEST_THREAD, feed.clone(), scheduler, feed_config());

    let watch = async {
        let synced = eventually(WAIT, || {
            engine.stats().passes_completed >= 1 && feed.subscriptions().len() >= 2
        })
        .await;
        listener.stop();
        synced
    };
    let (result, synced) = tokio::join!(listener.run(), watch);
    result.unwrap();

    assert!(synced);
    assert_eq!(feed.subscriptions()[..2], [None, None]);
    harness.assert_mirrors_remote();
}

#[tokio::test]
async fn events_for_other_threads_do_not_run_passes() {
    let harness = TestHarness::new();
    let engine = harness.shared_engine();
    let scheduler = Arc::new(SyncScheduler::new(Arc::clone(&engine)));

    let feed = Arc::new(MemoryFeed::new([FeedScript::Stream(vec![changed(
        "evt-7",
        "another-thread",
        "x.txt",
    )])]));
    let listener = ChangeFeedListener::new(TEST_THREAD, feed.clone(), scheduler, feed_config());

    let watch = async {
        let reconnected = eventually(WAIT, || feed.subscriptions().len() >= 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.stop();
        reconnected
    };
    let (result, reconnected) = tokio::join!(listener.run(), watch);
    result.unwrap();

    assert!(reconnected);
    assert_eq!(engine.stats().passes_completed, 0);
    // The id still advances so a reconnect does not replay the event.
    assert_eq!(feed.subscriptions()[1].as_deref(), Some("evt-7"));
}

#[tokio::test]
async fn interval_scheduler_runs_periodic_passes() {
    let harness = TestHarness::new();
    let engine = harness.shared_engine();
    let scheduler = SyncScheduler::new(Arc::clone(&engine));
    let stop = CancelToken::new();

    let watch = async {
        let ran = eventually(WAIT, || engine.stats().passes_completed >= 2).await;
        stop.cancel();
        ran
    };
    let ((), ran) = tokio::join!(scheduler.run_interval(Duration::from_millis(10), &stop), watch);

    assert!(ran);
    assert!(engine.stats().last_sync_time.is_some());
}
