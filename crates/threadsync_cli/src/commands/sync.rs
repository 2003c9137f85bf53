//! Sync command implementation.

use super::{open_engine, open_remote};
use crate::config::Settings;
use crate::error::CliResult;
use threadsync_engine::PassOutcome;

/// Runs one pass and prints what it changed.
pub async fn run(settings: &Settings) -> CliResult<()> {
    let engine = open_engine(settings, open_remote(settings)?)?;

    match engine.sync_now().await? {
        PassOutcome::Completed(report) => {
            println!(
                "Synced {}: {} downloaded, {} deleted, {} uploaded, {} deleted remotely, {} conflicts",
                settings.sync.thread_id,
                report.downloaded,
                report.deleted,
                report.uploaded,
                report.remote_deleted,
                report.conflicts
            );
            if let Some(cursor) = &report.final_cursor {
                println!("Cursor: {cursor}");
            }
        }
        PassOutcome::Coalesced => println!("A pass is already running"),
    }

    let conflicts = engine.conflicts()?;
    if !conflicts.is_empty() {
        println!(
            "{} unresolved conflict(s); run `threadsync conflicts` to list them",
            conflicts.len()
        );
    }
    Ok(())
}
