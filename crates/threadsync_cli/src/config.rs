//! Settings from an optional JSON config file overlaid by flags.
//!
//! ```json
//! {
//!   "baseUrl": "https://sync.example.com/api",
//!   "threadId": "team-notes",
//!   "workspaceRoot": "/home/me/Threads",
//!   "pageLimit": 200,
//!   "syncIntervalSecs": 300
//! }
//! ```

use crate::error::{CliError, CliResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use threadsync_engine::{RetryPolicy, SyncConfig};

const STATE_DIR_NAME: &str = ".threadsync";

/// Every setting the CLI understands. `None` means "not given here".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    /// Sync API base URL.
    pub base_url: Option<String>,
    /// Thread to mirror.
    pub thread_id: Option<String>,
    /// Device name used in conflict copies.
    pub device_id: Option<String>,
    /// Credential profile.
    pub profile_id: Option<String>,
    /// Directory holding one subdirectory per thread.
    pub workspace_root: Option<PathBuf>,
    /// Directory for the state store.
    pub state_dir: Option<PathBuf>,
    /// Manifest page size.
    pub page_limit: Option<u32>,
    /// Upload chunk size in bytes.
    pub chunk_size: Option<usize>,
    /// Concurrent transfer bound.
    pub max_concurrent_transfers: Option<usize>,
    /// Per-request timeout.
    pub request_timeout_secs: Option<u64>,
    /// Attempts per request, first included.
    pub max_retry_attempts: Option<u32>,
    /// Upload local edits.
    pub push_local_changes: Option<bool>,
    /// Periodic pass interval for `watch`.
    pub sync_interval_secs: Option<u64>,
    /// Idempotency ledger capacity.
    pub ledger_capacity: Option<usize>,
}

impl FileConfig {
    /// Reads a config file.
    pub fn load(path: &Path) -> CliResult<Self> {
        let data = std::fs::read(path).map_err(|source| CliError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| CliError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns `self` with every setting present in `over` replaced.
    pub fn overlay(self, over: FileConfig) -> Self {
        Self {
            base_url: over.base_url.or(self.base_url),
            thread_id: over.thread_id.or(self.thread_id),
            device_id: over.device_id.or(self.device_id),
            profile_id: over.profile_id.or(self.profile_id),
            workspace_root: over.workspace_root.or(self.workspace_root),
            state_dir: over.state_dir.or(self.state_dir),
            page_limit: over.page_limit.or(self.page_limit),
            chunk_size: over.chunk_size.or(self.chunk_size),
            max_concurrent_transfers: over
                .max_concurrent_transfers
                .or(self.max_concurrent_transfers),
            request_timeout_secs: over.request_timeout_secs.or(self.request_timeout_secs),
            max_retry_attempts: over.max_retry_attempts.or(self.max_retry_attempts),
            push_local_changes: over.push_local_changes.or(self.push_local_changes),
            sync_interval_secs: over.sync_interval_secs.or(self.sync_interval_secs),
            ledger_capacity: over.ledger_capacity.or(self.ledger_capacity),
        }
    }
}

/// Resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Engine configuration.
    pub sync: SyncConfig,
    /// Workspace root.
    pub workspace_root: PathBuf,
    /// State store root.
    pub state_dir: PathBuf,
}

impl Settings {
    /// Applies defaults and validates required settings.
    pub fn resolve(config: FileConfig) -> CliResult<Self> {
        let base_url = config.base_url.ok_or(CliError::MissingSetting("base-url"))?;
        let thread_id = config.thread_id.ok_or(CliError::MissingSetting("thread"))?;
        let device_id = config.device_id.unwrap_or_else(default_device);

        let mut sync = SyncConfig::new(thread_id, device_id, base_url);
        if let Some(profile) = config.profile_id {
            sync = sync.with_profile(profile);
        }
        if let Some(limit) = config.page_limit {
            sync = sync.with_page_limit(limit);
        }
        if let Some(size) = config.chunk_size {
            sync = sync.with_chunk_size(size);
        }
        if let Some(max) = config.max_concurrent_transfers {
            sync = sync.with_max_concurrent_transfers(max);
        }
        if let Some(secs) = config.request_timeout_secs {
            sync = sync.with_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = config.max_retry_attempts {
            sync = sync.with_retry(RetryPolicy::new(attempts));
        }
        if let Some(push) = config.push_local_changes {
            sync = sync.with_push(push);
        }
        if let Some(secs) = config.sync_interval_secs.filter(|s| *s > 0) {
            sync = sync.with_sync_interval(Duration::from_secs(secs));
        }
        if let Some(capacity) = config.ledger_capacity {
            sync = sync.with_ledger_capacity(capacity);
        }

        let workspace_root = config
            .workspace_root
            .unwrap_or_else(|| PathBuf::from("threads"));
        let state_dir = config
            .state_dir
            .unwrap_or_else(|| workspace_root.join(STATE_DIR_NAME));

        Ok(Self {
            sync,
            workspace_root,
            state_dir,
        })
    }
}

fn default_device() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> FileConfig {
        FileConfig {
            base_url: Some("https://sync.example.com".into()),
            thread_id: Some("notes".into()),
            ..FileConfig::default()
        }
    }

    #[test]
    fn load_reads_camel_case_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threadsync.json");
        std::fs::write(
            &path,
            br#"{"baseUrl": "https://a", "threadId": "t1", "pageLimit": 50, "pushLocalChanges": false}"#,
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("https://a"));
        assert_eq!(config.page_limit, Some(50));
        assert_eq!(config.push_local_changes, Some(false));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threadsync.json");
        std::fs::write(&path, br#"{"baseURL": "https://a"}"#).unwrap();
        assert!(matches!(
            FileConfig::load(&path),
            Err(CliError::ConfigParse { .. })
        ));
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig {
            page_limit: Some(10),
            chunk_size: Some(1024),
            ..required()
        };
        let flags = FileConfig {
            page_limit: Some(20),
            ..FileConfig::default()
        };

        let merged = file.overlay(flags);
        assert_eq!(merged.page_limit, Some(20));
        assert_eq!(merged.chunk_size, Some(1024));
        assert_eq!(merged.thread_id.as_deref(), Some("notes"));
    }

    #[test]
    fn resolve_applies_defaults() {
        let settings = Settings::resolve(FileConfig {
            workspace_root: Some(PathBuf::from("/mirror")),
            device_id: Some("laptop".into()),
            ..required()
        })
        .unwrap();

        assert_eq!(settings.sync.thread_id, "notes");
        assert_eq!(settings.sync.device_id, "laptop");
        assert!(settings.sync.push_local_changes);
        assert_eq!(settings.state_dir, PathBuf::from("/mirror").join(STATE_DIR_NAME));
        assert!(settings.sync.sync_interval.is_none());
    }

    #[test]
    fn resolve_requires_url_and_thread() {
        let err = Settings::resolve(FileConfig {
            thread_id: Some("t".into()),
            ..FileConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CliError::MissingSetting("base-url")));

        let err = Settings::resolve(FileConfig {
            base_url: Some("https://a".into()),
            ..FileConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CliError::MissingSetting("thread")));
    }
}
