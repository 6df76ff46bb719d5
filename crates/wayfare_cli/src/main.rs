//! Wayfare sync CLI
//!
//! Operator tools for the sync ledger a device keeps next to its data.
//! The ledger is locked by a running engine; stop the app first.
//!
//! # Commands
//!
//! - `inspect` - Display ledger statistics
//! - `queue` - List queued mutations
//! - `retry` - Reset failed entries so the next run tries them again
//! - `cursors` - Show pull cursors per entity type and route
//! - `conflicts` - List conflicts waiting for the user
//! - `dump` - Dump the ledger's live records
//! - `compact` - Rewrite the journal as one snapshot
//! - `config-check` - Validate a sync configuration file

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Wayfare sync ledger tools.
#[derive(Parser)]
#[command(name = "wayfare-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the ledger file
    #[arg(global = true, short, long)]
    ledger: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display ledger statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued mutations
    Queue {
        /// Only show entries that gave up
        #[arg(long)]
        failed: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Reset failed entries
    Retry {
        /// Entry to reset
        entry: Option<String>,

        /// Reset every failed entry
        #[arg(short, long)]
        all: bool,
    },

    /// Show pull cursors
    Cursors {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the ledger's live records
    Dump {
        /// Maximum number of records to dump
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Rewrite the journal as one snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Validate a sync configuration file
    ConfigCheck {
        /// Configuration file (JSON)
        file: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.ledger.ok_or("Ledger path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Queue { failed, format } => {
            let path = cli.ledger.ok_or("Ledger path required for queue")?;
            commands::queue::run(&path, failed, &format)?;
        }
        Commands::Retry { entry, all } => {
            let path = cli.ledger.ok_or("Ledger path required for retry")?;
            let target = match (entry, all) {
                (_, true) => commands::retry::Target::AllFailed,
                (Some(id), false) => commands::retry::Target::Entry(id.parse()?),
                (None, false) => return Err("Pass an entry id or --all".into()),
            };
            commands::retry::run(&path, target)?;
        }
        Commands::Cursors { format } => {
            let path = cli.ledger.ok_or("Ledger path required for cursors")?;
            commands::cursors::run(&path, &format)?;
        }
        Commands::Conflicts { all, format } => {
            let path = cli.ledger.ok_or("Ledger path required for conflicts")?;
            commands::conflicts::run(&path, all, &format)?;
        }
        Commands::Dump { limit } => {
            let path = cli.ledger.ok_or("Ledger path required for dump")?;
            commands::dump::run(&path, limit)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.ledger.ok_or("Ledger path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::ConfigCheck { file } => {
            commands::config_check::run(&file)?;
        }
        Commands::Version => {
            println!("wayfare-sync v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
