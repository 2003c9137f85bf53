//! Property-based tests over generated remote histories and local edits.

use proptest::prelude::*;
use threadsync_engine::RetryPolicy;
use threadsync_testkit::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn cursor_seq(harness: &TestHarness) -> u64 {
    harness
        .cursor()
        .and_then(|c| c.strip_prefix("cursor-").and_then(|n| n.parse().ok()))
        .unwrap_or(0)
}

fn history_with_edits() -> impl Strategy<Value = (Vec<RemoteOp>, Vec<LocalEdit>)> {
    path_pool_strategy(4).prop_flat_map(|paths| {
        (
            prop::collection::vec(remote_op_strategy(paths.clone()), 0..8),
            local_edits_strategy(paths, 6),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pass_mirrors_any_history(history in remote_history_strategy(4, 12)) {
        runtime().block_on(async {
            let harness = TestHarness::new();
            apply_history(&harness.remote, &history);

            let engine = harness.engine();
            engine.sync_now().await.unwrap();
            harness.assert_mirrors_remote();
            assert_eq!(harness.local_files(), harness.remote.files());

            harness.remote.reset_calls();
            engine.sync_now().await.unwrap();
            assert_eq!(harness.remote.calls().transfers(), 0);
        });
    }

    #[test]
    fn incremental_passes_converge(
        first in remote_history_strategy(3, 6),
        second in remote_history_strategy(3, 6),
    ) {
        runtime().block_on(async {
            let harness = TestHarness::new();
            let engine = harness.engine();

            apply_history(&harness.remote, &first);
            engine.sync_now().await.unwrap();
            apply_history(&harness.remote, &second);
            engine.sync_now().await.unwrap();

            harness.assert_mirrors_remote();
            assert_eq!(harness.local_files(), harness.remote.files());
        });
    }

    #[test]
    fn failed_passes_never_skip_items(
        history in remote_history_strategy(4, 10),
        plan in transient_plan_strategy(4),
    ) {
        runtime().block_on(async {
            let harness = TestHarness::with_config(|c| c.with_retry(RetryPolicy::no_retry()));
            apply_history(&harness.remote, &history);
            plan.arm(&harness.remote);

            let engine = harness.engine();
            let mut previous = 0;
            let mut converged = false;
            for _ in 0..=plan.faults().len() + 1 {
                let result = engine.sync_now().await;
                let seq = cursor_seq(&harness);
                assert!(seq >= previous, "cursor moved backwards");
                previous = seq;
                if result.is_ok() {
                    converged = true;
                    break;
                }
            }

            assert!(converged);
            harness.assert_mirrors_remote();
            assert_eq!(harness.local_files(), harness.remote.files());
        });
    }

    #[test]
    fn local_edits_are_pushed((history, edits) in history_with_edits()) {
        runtime().block_on(async {
            let harness = TestHarness::new();
            apply_history(&harness.remote, &history);
            let engine = harness.engine();
            engine.sync_now().await.unwrap();

            for edit in &edits {
                edit.apply(&harness);
            }
            engine.sync_now().await.unwrap();

            assert_eq!(harness.local_files(), harness.remote.files());
            for path in harness.local_files() {
                assert_eq!(harness.read_local(&path), harness.remote.content(&path), "{path}");
            }
            assert!(engine.conflicts().unwrap().is_empty());

            harness.remote.reset_calls();
            engine.sync_now().await.unwrap();
            assert_eq!(harness.remote.calls().transfers(), 0);
        });
    }
}
