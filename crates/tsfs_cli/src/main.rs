//! tsfs CLI
//!
//! Offline tools for tsfs stores. Every command takes the store lock, so
//! none of them can run against a store a live server has open.
//!
//! # Commands
//!
//! - `check` - Recover and check the directory structure
//! - `extract` - Print a time series, blob or MJD series
//! - `dump-log` - List leftover transaction logs without recovering them
//! - `status` - Print the status report as JSON
//! - `copy` - Copy matching ids into another store
//! - `clean` - Delete all data

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tsfs command-line store tools.
#[derive(Parser)]
#[command(name = "tsfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recovery and check the directory structure
    Check {
        /// Report problems without repairing them
        #[arg(short, long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the committed content of one item
    Extract {
        #[command(subcommand)]
        target: commands::extract::Target,
    },

    /// List leftover transaction logs and their states
    DumpLog {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the status report as JSON
    Status,

    /// Copy every id matching a query into another store
    Copy {
        /// Destination store directory
        #[arg(long)]
        to: PathBuf,

        /// Query selecting the ids, e.g. 'ts@/pa/*'
        #[arg(short, long)]
        query: String,

        /// Ids per copy transaction
        #[arg(short, long, default_value = "64")]
        batch: usize,

        /// Batches buffered between pipeline stages
        #[arg(long, default_value = "4")]
        capacity: usize,
    },

    /// Delete every item in the store
    Clean {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        Commands::Check { dry_run, format } => {
            let path = cli.path.ok_or("Store path required for check")?;
            commands::check::run(&path, dry_run, &format)?;
        }
        Commands::Extract { target } => {
            let path = cli.path.ok_or("Store path required for extract")?;
            commands::extract::run(&path, &target)?;
        }
        Commands::DumpLog { format } => {
            let path = cli.path.ok_or("Store path required for dump-log")?;
            commands::dump_log::run(&path, &format)?;
        }
        Commands::Status => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path)?;
        }
        Commands::Copy {
            to,
            query,
            batch,
            capacity,
        } => {
            let path = cli.path.ok_or("Source store path required for copy")?;
            let copied = commands::copy::run(&path, &to, &query, batch, capacity)?;
            println!("✓ Copied {} items", copied.items);
        }
        Commands::Clean { yes } => {
            let path = cli.path.ok_or("Store path required for clean")?;
            commands::clean::run(&path, yes)?;
        }
        Commands::Version => {
            println!("tsfs CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("tsfs core v{}", tsfs_core::VERSION);
        }
    }

    Ok(())
}
