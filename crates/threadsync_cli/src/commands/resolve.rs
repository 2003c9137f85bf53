//! Resolve command implementation.

use super::{open_engine, open_remote};
use crate::config::Settings;
use crate::error::{CliError, CliResult};
use threadsync_engine::Resolution;

/// Parses a user-facing resolution name.
pub fn parse_resolution(name: &str) -> CliResult<Resolution> {
    Resolution::parse(name).ok_or_else(|| CliError::UnknownResolution(name.to_string()))
}

/// Applies a resolution to the conflict named by `path`.
pub async fn run(settings: &Settings, path: &str, resolution: Resolution) -> CliResult<()> {
    let engine = open_engine(settings, open_remote(settings)?)?;
    engine.resolve_conflict(path, resolution).await?;

    match resolution {
        Resolution::PickLocal => println!("{path}: local copy uploaded"),
        Resolution::PickRemote => println!("{path}: local copy discarded"),
        Resolution::KeepBoth => println!("{path}: both copies kept; the local copy syncs as a new file"),
        Resolution::Unresolved => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dashed_and_short_names() {
        assert_eq!(parse_resolution("pick-local").unwrap(), Resolution::PickLocal);
        assert_eq!(parse_resolution("remote").unwrap(), Resolution::PickRemote);
        assert_eq!(parse_resolution("keep_both").unwrap(), Resolution::KeepBoth);
    }

    #[test]
    fn rejects_unknown_and_unresolved() {
        assert!(matches!(
            parse_resolution("merge"),
            Err(CliError::UnknownResolution(_))
        ));
        assert!(parse_resolution("unresolved").is_err());
    }
}
