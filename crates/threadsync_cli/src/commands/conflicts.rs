//! Conflicts command implementation.

use super::{open_engine, open_remote, Format};
use crate::config::Settings;
use crate::error::CliResult;

/// Lists unresolved conflicts.
pub fn run(settings: &Settings, format: Format) -> CliResult<()> {
    let engine = open_engine(settings, open_remote(settings)?)?;
    let conflicts = engine.conflicts()?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&conflicts)?),
        Format::Text if conflicts.is_empty() => println!("No unresolved conflicts"),
        Format::Text => {
            for conflict in &conflicts {
                println!("{}", conflict.path);
                println!("  local copy:  {}", conflict.conflict_path);
                println!(
                    "  remote:      {}",
                    conflict.remote_revision.as_deref().unwrap_or("(deleted)")
                );
                println!("  detected:    {}", conflict.detected_at);
            }
        }
    }
    Ok(())
}
