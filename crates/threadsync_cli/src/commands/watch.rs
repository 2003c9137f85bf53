//! Watch command implementation.

use super::{open_engine, open_remote};
use crate::config::Settings;
use crate::error::CliResult;
use std::sync::Arc;
use threadsync_engine::{
    CancelToken, ChangeFeedListener, PassRequester, SyncScheduler, TriggerReason,
};
use tracing::{info, warn};

/// Runs a pass, then follows the change feed (and the optional interval)
/// until Ctrl-C.
pub async fn run(settings: &Settings) -> CliResult<()> {
    let remote = open_remote(settings)?;
    let engine = Arc::new(open_engine(settings, Arc::clone(&remote))?);
    let scheduler = Arc::new(SyncScheduler::new(Arc::clone(&engine)));
    let listener = ChangeFeedListener::new(
        settings.sync.thread_id.clone(),
        remote,
        Arc::clone(&scheduler),
        settings.sync.feed.clone(),
    );
    let stop = CancelToken::new();

    scheduler.request_pass(TriggerReason::Manual);
    info!(
        thread = %settings.sync.thread_id,
        interval = ?settings.sync.sync_interval,
        "watching for changes"
    );

    let interval = async {
        match settings.sync.sync_interval {
            Some(period) => scheduler.run_interval(period, &stop).await,
            None => stop.cancelled().await,
        }
    };
    let feed = async {
        let result = listener.run().await;
        stop.cancel();
        result
    };
    let work = async { tokio::join!(feed, interval).0 };

    tokio::select! {
        result = work => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "cannot listen for Ctrl-C; stopping");
            }
            info!("stopping");
            listener.stop();
            stop.cancel();
            engine.cancel();
        }
    }
    Ok(())
}
