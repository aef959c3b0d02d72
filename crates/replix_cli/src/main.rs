//! Replix CLI
//!
//! Command-line tools for looking at the commit metadata a Replix index
//! persists with every commit.
//!
//! # Commands
//!
//! - `inspect` - Decode a commit-metadata blob and print it as JSON
//! - `resolve` - Show how a replication manager would start from a blob

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Replix commit-metadata tools.
#[derive(Parser)]
#[command(name = "replix")]
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
    /// Decode commit metadata and print it as JSON
    Inspect {
        /// File holding the raw metadata blob
        file: PathBuf,
    },

    /// Print the startup decision for commit metadata
    Resolve {
        /// File holding the raw metadata blob
        file: PathBuf,

        /// Index format version the generation declares
        #[arg(short, long)]
        format_version: u32,

        /// Stay shut down if the source collection was missing last run
        #[arg(short, long)]
        shut_down_when_missing: bool,
    },

    /// Show version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Inspect { file } => commands::inspect::run(&file),
        Commands::Resolve {
            file,
            format_version,
            shut_down_when_missing,
        } => commands::resolve::run(&file, format_version, shut_down_when_missing),
        Commands::Version => {
            println!("Replix CLI v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
