//! DX Command Line Interface
//!
//! Offline inspection of a node's sled data directory, Merkle tooling and
//! an in-process cluster simulation.
//!
//! Configuration is loaded from environment variables (via .env file).
//! Command-line arguments override environment variables.
//!
//! Usage:
//!   dx status <operation-id>     - Show an operation and its responses
//!   dx operations                - List operations
//!   dx commands                  - List scheduler commands
//!   dx finality <locator>        - Show finality acks for a locator
//!   dx stats                     - Storage statistics
//!   dx merkle root|prove|verify  - Merkle tooling over a leaves file
//!   dx simulate                  - Publish through an in-memory cluster

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "dx")]
#[command(about = "DX node operation engine tools")]
#[command(version)]
pub struct Cli {
    /// Node data directory
    #[arg(short, long, env = "DX_DATA_DIR", default_value = "./dx_data")]
    data_dir: PathBuf,

    /// Enable logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show an operation, its responses and its commands
    Status {
        /// Operation ID
        operation_id: String,
    },

    /// List operations
    Operations {
        /// Filter by status
        #[arg(short, long)]
        status: Option<OperationStatusArg>,
    },

    /// List scheduler commands
    Commands {
        /// Filter by status
        #[arg(short, long)]
        status: Vec<CommandStatusArg>,
        /// Only commands owned by this operation
        #[arg(short, long)]
        operation_id: Option<String>,
    },

    /// Show finality state and acks of a locator
    Finality {
        /// Asset locator (UAL)
        locator: String,
    },

    /// Storage statistics
    Stats,

    /// Merkle tooling over a file with one leaf per line
    Merkle {
        #[command(subcommand)]
        action: MerkleCommands,
    },

    /// Publish a generated dataset through an in-memory cluster
    Simulate {
        /// Number of replica nodes
        #[arg(short, long, default_value = "3")]
        replicas: usize,
        /// Number of leaves in the dataset
        #[arg(short, long, default_value = "8")]
        leaves: usize,
        /// Replication factor (defaults to REPLICATION_FACTOR)
        #[arg(long)]
        replication_factor: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum MerkleCommands {
    /// Compute the root of the canonical leaves
    Root {
        /// Leaves file
        file: PathBuf,
    },
    /// Print the inclusion proof of one canonical leaf
    Prove {
        /// Leaves file
        file: PathBuf,
        /// Leaf index in canonical order
        index: usize,
    },
    /// Check a leaf against a root
    Verify {
        /// Leaves file
        file: PathBuf,
        /// Leaf index in canonical order
        index: usize,
        /// Expected root (hex)
        #[arg(short, long)]
        root: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OperationStatusArg {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CommandStatusArg {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Failed,
    Repeating,
    Expired,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if cli.verbose {
        init_logging();
    }

    if let Err(e) = commands::run(cli.command, &cli.data_dir).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dx_engine=info,dx_network=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
