//! possync CLI
//!
//! Runs replication against a configured remote from a terminal, keeping
//! the local side in a JSON snapshot file.
//!
//! # Commands
//!
//! - `sync` - Run one manual sync cycle for a collection
//! - `watch` - Run live sessions for every configured collection
//! - `inspect` - Display document counts of a snapshot

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// possync command-line tools.
#[derive(Parser)]
#[command(name = "possync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle and print the result as JSON
    Sync {
        /// Path to the JSON sync configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the local snapshot (created if missing)
        #[arg(short, long)]
        local: PathBuf,

        /// Collection to sync
        #[arg(short = 'n', long)]
        collection: String,
    },

    /// Replicate live until Ctrl-C
    Watch {
        /// Path to the JSON sync configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the local snapshot (created if missing)
        #[arg(short, long)]
        local: PathBuf,
    },

    /// Display document counts per collection
    Inspect {
        /// Path to the local snapshot
        #[arg(short, long)]
        local: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync {
            config,
            local,
            collection,
        } => {
            commands::sync::run(&config, &local, &collection).await?;
        }
        Commands::Watch { config, local } => {
            commands::watch::run(&config, &local).await?;
        }
        Commands::Inspect { local, format } => {
            commands::inspect::run(&local, &format)?;
        }
        Commands::Version => {
            println!("possync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
