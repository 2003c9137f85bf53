//! threadsync CLI
//!
//! Command-line client that mirrors one thread of a sync server into a local
//! directory.
//!
//! # Commands
//!
//! - `sync` - Run one reconciliation pass
//! - `watch` - Sync, then follow the change feed until Ctrl-C
//! - `status` - Show the stored cursor, last error and pending work
//! - `conflicts` - List unresolved conflicts
//! - `resolve` - Apply a decision to a conflict
//!
//! Settings come from an optional JSON file (`--config`) overlaid by flags.
//! Access tokens are read from `THREADSYNC_ACCESS_TOKEN` (or the
//! profile-scoped `THREADSYNC_<PROFILE>_ACCESS_TOKEN`).

mod client;
mod commands;
mod config;
mod error;

use clap::{Parser, Subcommand};
use commands::Format;
use config::{FileConfig, Settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Mirror a sync thread into a local directory.
#[derive(Parser)]
#[command(name = "threadsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Sync API base URL
    #[arg(global = true, long)]
    base_url: Option<String>,

    /// Thread to mirror
    #[arg(global = true, short, long)]
    thread: Option<String>,

    /// Directory holding one subdirectory per thread
    #[arg(global = true, short, long)]
    workspace: Option<PathBuf>,

    /// Directory for sync state
    #[arg(global = true, long)]
    state_dir: Option<PathBuf>,

    /// Credential profile
    #[arg(global = true, long)]
    profile: Option<String>,

    /// Device name used in conflict copies
    #[arg(global = true, long)]
    device: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass
    Sync {
        /// Only pull; leave local edits unsent
        #[arg(long)]
        no_push: bool,

        /// Manifest page size
        #[arg(long)]
        page_limit: Option<u32>,
    },

    /// Sync, then follow the change feed until Ctrl-C
    Watch {
        /// Also run a pass every N seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Only pull; leave local edits unsent
        #[arg(long)]
        no_push: bool,
    },

    /// Show the stored cursor, last error and pending work
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List unresolved conflicts
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Apply a decision to a conflict
    Resolve {
        /// Parked copy, or the original path when only one copy is parked
        path: String,

        /// pick-local, pick-remote or keep-both
        resolution: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    /// Settings given as flags, before the config file is applied.
    fn flags(&self) -> FileConfig {
        let mut flags = FileConfig {
            base_url: self.base_url.clone(),
            thread_id: self.thread.clone(),
            device_id: self.device.clone(),
            profile_id: self.profile.clone(),
            workspace_root: self.workspace.clone(),
            state_dir: self.state_dir.clone(),
            ..FileConfig::default()
        };
        match &self.command {
            Commands::Sync {
                no_push,
                page_limit,
            } => {
                flags.push_local_changes = no_push.then_some(false);
                flags.page_limit = *page_limit;
            }
            Commands::Watch { interval, no_push } => {
                flags.push_local_changes = no_push.then_some(false);
                flags.sync_interval_secs = *interval;
            }
            _ => {}
        }
        flags
    }

    fn settings(&self) -> Result<Settings, error::CliError> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Settings::resolve(file.overlay(self.flags()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Sync { .. } => {
            commands::sync::run(&cli.settings()?).await?;
        }
        Commands::Watch { .. } => {
            commands::watch::run(&cli.settings()?).await?;
        }
        Commands::Status { format } => {
            commands::status::run(&cli.settings()?, Format::parse(format)?)?;
        }
        Commands::Conflicts { format } => {
            commands::conflicts::run(&cli.settings()?, Format::parse(format)?)?;
        }
        Commands::Resolve { path, resolution } => {
            let resolution = commands::resolve::parse_resolution(resolution)?;
            commands::resolve::run(&cli.settings()?, path, resolution).await?;
        }
        Commands::Version => {
            println!("threadsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "threadsync protocol v{}",
                threadsync_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
