//! Status command implementation.

use super::{open_engine, open_remote, Format};
use crate::config::Settings;
use crate::error::CliResult;
use serde::Serialize;
use threadsync_engine::LastError;

/// Stored state of one thread.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Thread id.
    pub thread_id: String,
    /// Workspace directory of the thread.
    pub workspace: String,
    /// Stored manifest cursor.
    pub cursor: Option<String>,
    /// Error of the last failed pass, if it has not been cleared.
    pub last_error: Option<LastError>,
    /// Unresolved conflicts.
    pub unresolved_conflicts: usize,
    /// Journaled transfers awaiting resumption.
    pub pending_operations: usize,
}

/// Prints the stored state without contacting the server.
pub fn run(settings: &Settings, format: Format) -> CliResult<()> {
    let engine = open_engine(settings, open_remote(settings)?)?;
    let status = engine.status()?;

    let report = StatusReport {
        thread_id: status.thread_id,
        workspace: settings
            .workspace_root
            .join(&settings.sync.thread_id)
            .display()
            .to_string(),
        cursor: status.cursor.map(|c| c.as_str().to_string()),
        last_error: status.last_error,
        unresolved_conflicts: status.unresolved_conflicts,
        pending_operations: status.pending_operations,
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            println!("Thread:     {}", report.thread_id);
            println!("Workspace:  {}", report.workspace);
            println!(
                "Cursor:     {}",
                report.cursor.as_deref().unwrap_or("(none, full pass pending)")
            );
            println!("Conflicts:  {}", report.unresolved_conflicts);
            println!("Pending:    {}", report.pending_operations);
            if let Some(error) = &report.last_error {
                let path = error.path.as_deref().unwrap_or("-");
                let kind = if error.retryable { "retryable" } else { "needs attention" };
                println!(
                    "Last error: {} (path {path}, {kind}, at {})",
                    error.message, error.occurred_at
                );
            }
        }
    }
    Ok(())
}
