//! # carelog
//!
//! Device-side command line tool for carelog sync.
//!
//! ## Commands
//!
//! - `init`: Initialize device identity
//! - `login`: Save server URL and token
//! - `log`: Record an event locally (works offline)
//! - `push` / `pull`: Run one half of a sync cycle
//! - `sync`: Push then pull
//! - `status`: Show queue and cursor
//! - `watch`: Stay in sync until interrupted
//! - `retry`: Requeue stalled changes, list or settle issues
//!
//! ## Example
//!
//! ```bash
//! carelog init --name "Kitchen tablet"
//! carelog login --server http://localhost:8080 --token secret-a
//!
//! # Recorded offline, sent with the next sync
//! carelog log feeding '{"ml": 120, "side": "left"}'
//! carelog sync
//!
//! carelog watch
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;

use commands::retry::RetryAction;
use commands::{init, log, login, pull, push, retry, status, sync, watch};

/// Device-side command line tool for carelog sync.
#[derive(Parser, Debug)]
#[command(name = "carelog")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for device identity, account and local store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize device identity
    Init {
        /// Device name
        #[arg(long, short)]
        name: String,
    },

    /// Save server URL and bearer token
    Login {
        /// Server base URL
        #[arg(long, short)]
        server: String,

        /// Bearer token
        #[arg(long, short)]
        token: String,
    },

    /// Record an event locally
    Log {
        /// Entity type: feeding, sleep, medication, vaccination, appointment, note
        entity_type: String,

        /// Fields as a JSON object (not needed for delete)
        fields: Option<String>,

        /// Operation: create, update or delete
        #[arg(long, default_value = "create")]
        op: String,

        /// Entity id (generated for creates if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Push queued changes
    Push,

    /// Pull committed changes
    Pull,

    /// Push, then pull
    Sync,

    /// Show sync status
    Status {
        /// Also ask the server for the family head
        #[arg(long)]
        remote: bool,
    },

    /// Stay in sync until interrupted
    Watch,

    /// Requeue stalled changes (default), or list and settle issues
    Retry {
        /// List conflicts, rejections and dead-letters
        #[arg(long, conflicts_with_all = ["discard", "dismiss"])]
        list: bool,

        /// Drop a queued change by mutation id
        #[arg(long, conflicts_with = "dismiss")]
        discard: Option<String>,

        /// Forget a listed issue
        #[arg(long)]
        dismiss: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    match cli.command {
        Commands::Init { name } => init::run(&data_dir, &name).await?,
        Commands::Login { server, token } => login::run(&data_dir, &server, &token).await?,
        Commands::Log {
            entity_type,
            fields,
            op,
            id,
        } => {
            log::run(
                &data_dir,
                &entity_type,
                &op,
                id.as_deref(),
                fields.as_deref(),
            )
            .await?
        }
        Commands::Push => push::run(&data_dir).await?,
        Commands::Pull => pull::run(&data_dir).await?,
        Commands::Sync => sync::run(&data_dir).await?,
        Commands::Status { remote } => status::run(&data_dir, remote).await?,
        Commands::Watch => watch::run(&data_dir).await?,
        Commands::Retry {
            list,
            discard,
            dismiss,
        } => {
            let action = match (list, discard, dismiss) {
                (true, _, _) => RetryAction::List,
                (_, Some(id), _) => RetryAction::Discard(id),
                (_, _, Some(id)) => RetryAction::Dismiss(id),
                _ => RetryAction::Requeue,
            };
            retry::run(&data_dir, action).await?
        }
    }

    Ok(())
}

/// Get the default data directory for carelog.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("app", "carelog", "carelog")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
