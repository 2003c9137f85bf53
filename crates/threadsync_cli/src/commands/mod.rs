//! CLI command implementations.

pub mod conflicts;
pub mod resolve;
pub mod status;
pub mod sync;
pub mod watch;

use crate::client::ReqwestClient;
use crate::config::Settings;
use crate::error::{CliError, CliResult};
use std::sync::Arc;
use std::time::Duration;
use threadsync_engine::{
    EnvCredentials, FileStateStore, HttpRemote, LocalWorkspace, SyncEngine,
};

/// Remote used by every command.
pub type Remote = HttpRemote<ReqwestClient>;

/// Engine used by every command.
pub type Engine = SyncEngine<Remote, FileStateStore, LocalWorkspace>;

/// Output format for reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses `text` or `json`.
    pub fn parse(name: &str) -> CliResult<Self> {
        match name {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Builds the HTTP remote for `settings`.
pub fn open_remote(settings: &Settings) -> CliResult<Arc<Remote>> {
    let client = ReqwestClient::new(Duration::from_secs(10))?;
    Ok(Arc::new(HttpRemote::from_config(
        &settings.sync,
        client,
        Arc::new(EnvCredentials::new()),
    )))
}

/// Opens the state store and builds an engine over `remote`.
///
/// Fails if another process holds the thread's state.
pub fn open_engine(settings: &Settings, remote: Arc<Remote>) -> CliResult<Engine> {
    let store = FileStateStore::open(&settings.state_dir)?
        .with_ledger_capacity(settings.sync.ledger_capacity);
    store.open_thread(&settings.sync.thread_id)?;
    let workspace = LocalWorkspace::new(&settings.workspace_root);
    Ok(SyncEngine::new(
        settings.sync.clone(),
        remote,
        Arc::new(store),
        Arc::new(workspace),
    )?)
}
