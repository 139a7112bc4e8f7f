//! dlchan CLI: runs the challenge server and administers its stores.
//!
//! `dlchan serve` starts the evaluator loop and the status gateway; the other
//! subcommands submit artifacts and inspect or prune the file-backed stores
//! of a workspace.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// dlchan: continuous leaderboard for submitted classification models
#[derive(Parser, Debug)]
#[command(name = "dlchan", version, about, long_about = None)]
struct Cli {
    /// Workspace directory holding data, uploads and logs
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the evaluator loop and the status gateway
    Serve {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,
        /// Keep queued submissions from a previous run
        #[arg(long)]
        keep_queue: bool,
    },
    /// Upload a model artifact and queue it for evaluation
    Submit {
        /// Path to the artifact
        file: PathBuf,
    },
    /// Inspect or clear the run queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Inspect or prune the score table
    Table {
        #[command(subcommand)]
        action: TableAction,
    },
    /// Show the evaluation history
    History {
        /// Only show the most recent records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Load an artifact and describe it without queueing it
    Inspect {
        /// Path to the artifact
        model: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum QueueAction {
    /// List waiting submissions, oldest first
    List,
    /// Drop every waiting submission
    Clear,
}

#[derive(clap::Subcommand, Debug)]
enum TableAction {
    /// Print the ranking
    Show,
    /// Print the leader and its accuracy curve as JSON
    Top,
    /// Keep only the best entries
    Prune {
        /// Number of entries to keep
        #[arg(short, long)]
        keep: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration to `.dlchan/config.toml`
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());
    let loaded = dlchan_core::load_config(Some(&workspace), cli.config.as_deref());

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = match &loaded {
        Ok(config) => config.paths(&workspace).log_dir,
        Err(_) => directories::ProjectDirs::from("org", "dlchan", "dlchan")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "dlchan.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    match cli.command {
        // Config commands must work even when the current configuration does not load.
        Commands::Config { action } => {
            commands::handle_config(action, &workspace, cli.config.as_deref())
        }
        command => {
            let config = loaded.map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            commands::handle_command(command, &workspace, config).await
        }
    }
}
