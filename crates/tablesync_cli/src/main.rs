//! tablesync CLI
//!
//! Runs syncs between JSON endpoint files and inspects sync state.
//!
//! # Commands
//!
//! - `run` - Sync two endpoint files under a configuration
//! - `inspect-checkpoint` - Display a stored checkpoint
//! - `choices` - Display dropdown fields detected in a record schema

mod commands;
mod files;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tablesync command-line tools.
#[derive(Parser)]
#[command(name = "tablesync")]
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
    /// Sync a record endpoint file with a spreadsheet endpoint file
    Run {
        /// Sync configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Record endpoint file (JSON)
        #[arg(short, long)]
        left: PathBuf,

        /// Spreadsheet endpoint file (JSON)
        #[arg(short, long)]
        right: PathBuf,

        /// Linked tables file (JSON) for cross-reference fields
        #[arg(long)]
        links: Option<PathBuf>,

        /// Directory holding checkpoints and locks
        #[arg(short, long, default_value = ".tablesync")]
        state_dir: PathBuf,

        /// Requests per second per endpoint (0 = unlimited)
        #[arg(long, default_value = "0")]
        rps: u32,

        /// Append run reports to this JSON lines file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Compute the run without writing endpoints or checkpoint back
        #[arg(long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display a stored checkpoint
    InspectCheckpoint {
        /// Checkpoint file
        file: PathBuf,

        /// List every entry
        #[arg(short, long)]
        entries: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display dropdown fields detected in a record endpoint's schema
    Choices {
        /// Sync configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Record endpoint file (JSON)
        #[arg(short, long)]
        left: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            left,
            right,
            links,
            state_dir,
            rps,
            audit_log,
            dry_run,
            format,
        } => {
            let options = commands::run::RunOptions {
                config,
                left,
                right,
                links,
                state_dir,
                requests_per_second: rps,
                audit_log,
                dry_run,
            };
            commands::run::run(&options, &format)?;
        }
        Commands::InspectCheckpoint {
            file,
            entries,
            format,
        } => {
            commands::inspect_checkpoint::run(&file, entries, &format)?;
        }
        Commands::Choices {
            config,
            left,
            format,
        } => {
            commands::choices::run(&config, &left, &format)?;
        }
        Commands::Version => {
            println!("tablesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("checkpoint format v{}", tablesync_protocol::CHECKPOINT_VERSION);
        }
    }

    Ok(())
}
