//! coedit-sync command line.
//!
//! ```bash
//! # Single instance with a local update log
//! coedit-sync serve --bind 0.0.0.0:1234 --data-dir ./coedit-data
//!
//! # Shared hub plus two instances replicating through it
//! coedit-sync hub --bind 0.0.0.0:6380 --data-dir ./hub-data
//! coedit-sync serve --bind 0.0.0.0:1234 --hub-url ws://127.0.0.1:6380
//! coedit-sync serve --bind 0.0.0.0:1235 --hub-url ws://127.0.0.1:6380
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use coedit_sync::{HubConfig, HubServer, ServerConfig, SyncServer};

/// Real-time collaborative document sync server
#[derive(Parser)]
#[command(name = "coedit-sync")]
#[command(version)]
#[command(about = "Real-time collaborative document sync server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve documents to WebSocket clients
    Serve(ServeArgs),
    /// Run the replication hub shared by several servers
    Hub(HubArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "COEDIT_BIND", default_value = "127.0.0.1:1234")]
    bind: String,

    /// Heartbeat interval in seconds
    #[arg(long, env = "COEDIT_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Outbound queue capacity per connection
    #[arg(long, env = "COEDIT_OUTBOX_CAPACITY", default_value_t = 256)]
    outbox_capacity: usize,

    /// Log entries at which a document is compacted on load
    #[arg(long, env = "COEDIT_COMPACTION_THRESHOLD", default_value_t = 50)]
    compaction_threshold: usize,

    /// Seconds before an idle awareness identity is dropped
    #[arg(long, env = "COEDIT_AWARENESS_TIMEOUT_SECS", default_value_t = 30)]
    awareness_timeout_secs: u64,

    /// Directory of the local update log (ignored with --hub-url)
    #[arg(long, env = "COEDIT_DATA_DIR", default_value = "./coedit-data")]
    data_dir: PathBuf,

    /// Hub to replicate through and persist to
    #[arg(long, env = "COEDIT_HUB_URL")]
    hub_url: Option<String>,

    /// Hub request timeout in seconds
    #[arg(long, env = "COEDIT_HUB_TIMEOUT_SECS", default_value_t = 5)]
    hub_timeout_secs: u64,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            outbox_capacity: args.outbox_capacity,
            compaction_threshold: args.compaction_threshold,
            awareness_timeout: Duration::from_secs(args.awareness_timeout_secs),
            storage_path: args.data_dir,
            hub_url: args.hub_url,
            hub_request_timeout: Duration::from_secs(args.hub_timeout_secs),
        }
    }
}

#[derive(Args)]
struct HubArgs {
    /// Address to listen on
    #[arg(long, env = "COEDIT_HUB_BIND", default_value = "127.0.0.1:6380")]
    bind: String,

    /// Directory of the shared update log; relay only when omitted
    #[arg(long, env = "COEDIT_HUB_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => serve(args.into()).await,
        Commands::Hub(args) => {
            hub(HubConfig {
                bind_addr: args.bind,
                storage_path: args.data_dir,
            })
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting coedit-sync server on {}", config.bind_addr);
    let server = SyncServer::open(config).await?;

    let runner = server.clone();
    let mut task = tokio::spawn(async move { runner.run().await });
    tokio::select! {
        res = &mut task => return Ok(res??),
        _ = tokio::signal::ctrl_c() => server.shutdown(),
    }
    task.await??;
    Ok(())
}

async fn hub(config: HubConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting coedit-sync hub on {}", config.bind_addr);
    let hub = HubServer::open(config)?;

    let runner = hub.clone();
    let mut task = tokio::spawn(async move { runner.run().await });
    tokio::select! {
        res = &mut task => return Ok(res??),
        _ = tokio::signal::ctrl_c() => hub.shutdown(),
    }
    task.await??;
    Ok(())
}
