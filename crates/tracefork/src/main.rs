//! tracefork - Transaction Replay and Path Forensics
//!
//! Replays transactions through a node's debugging API and prints the
//! reconstructed execution paths, pre-states and call snapshots as JSON.

use alloy_primitives::{Address, TxHash};
use clap::{Parser, Subcommand};
use eyre::Result;
use std::{path::PathBuf, time::Duration};
use tracefork_engine::{Deadline, EngineConfig, Simulator};
use tracing::Level;

mod cmd;

/// Command-line interface for tracefork
#[derive(Debug, Parser)]
#[command(name = "tracefork")]
#[command(about = "Transaction replay and execution-path forensics for Ethereum nodes")]
#[command(version)]
pub struct Cli {
    /// Node RPC endpoint (http, https, ws or wss)
    #[arg(long, env = "TRACEFORK_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Configuration file (default: ~/.tracefork.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay a mined transaction and print its execution path
    Replay {
        /// Transaction hash to replay
        tx_hash: TxHash,

        /// Block the replay is attributed to
        #[arg(long)]
        block: Option<u64>,

        /// Contract the path window is anchored to (default: the whole path)
        #[arg(long)]
        protected: Option<Address>,

        /// Add a structural analysis of the path
        #[arg(long)]
        analyze: bool,

        /// Replay a second transaction and compare both paths
        #[arg(long)]
        compare: Option<TxHash>,
    },
    /// Print the pre-state of a transaction as a state override
    Prestate {
        /// Transaction hash
        tx_hash: TxHash,
    },
    /// Print the state at each entry into a protected contract
    Snapshots {
        /// Transaction hash
        tx_hash: TxHash,

        /// Contract whose entries are captured
        #[arg(long)]
        protected: Address,

        /// Only print entry number INDEX (zero-based, clamped to the last)
        #[arg(long)]
        index: Option<usize>,
    },
    /// Print the call tree of a transaction
    CallTree {
        /// Transaction hash
        tx_hash: TxHash,
    },
}

impl Cli {
    /// Engine configuration from the config file, environment and flags
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load_from(path)?,
            None => EngineConfig::load()?,
        };
        if let Some(url) = &self.rpc_url {
            config = config.with_rpc_url(url.clone());
        }
        if let Some(secs) = self.timeout {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracefork_common::logging::init_logging_at("tracefork", false, level)?;

    let config = cli.engine_config()?;
    tracing::info!("Using RPC endpoint: {}", config.rpc_url);
    let simulator = Simulator::new(config)?;

    let deadline = Deadline::none();
    let token = deadline.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, cancelling...");
            token.cancel();
        }
    });

    let output = match cli.command {
        Commands::Replay { tx_hash, block, protected, analyze, compare } => {
            let options = cmd::ReplayOptions {
                block,
                protected: protected.unwrap_or_default(),
                analyze,
                compare,
            };
            cmd::replay(&simulator, tx_hash, &options, &deadline).await?
        }
        Commands::Prestate { tx_hash } => cmd::prestate(&simulator, tx_hash, &deadline).await?,
        Commands::Snapshots { tx_hash, protected, index } => {
            cmd::snapshots(&simulator, tx_hash, protected, index, &deadline).await?
        }
        Commands::CallTree { tx_hash } => cmd::call_tree(&simulator, tx_hash, &deadline).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
