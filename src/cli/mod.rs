//! Command-line interface for `gantry`.

pub mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use uuid::Uuid;

use crate::error::Result;

/// Issue tracker with an external-project migration engine.
#[derive(Debug, Parser)]
#[command(name = "gantry", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Also write JSON logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import a project from a remote tracker.
    Import(ImportArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[command(subcommand)]
    pub command: ImportCommands,
}

#[derive(Debug, Subcommand)]
pub enum ImportCommands {
    /// Run a full project import and watch it to completion.
    Run(ImportRunArgs),
}

#[derive(Debug, Args)]
pub struct ImportRunArgs {
    /// Source project key on the remote tracker.
    #[arg(long)]
    pub project: String,

    /// Target workspace id.
    #[arg(long)]
    pub workspace: Uuid,

    /// Acting user recorded on the session (defaults to $GANTRY_ACTOR or
    /// $USER).
    #[arg(long)]
    pub actor: Option<String>,

    /// Import settings file (gantry.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Target database path.
    #[arg(long, default_value = "gantry.db")]
    pub db: PathBuf,

    /// Blob storage directory for attachments and avatars.
    #[arg(long, default_value = "gantry-blobs")]
    pub blob_dir: PathBuf,
}

/// Parse arguments, initialize logging, and dispatch.
///
/// # Errors
///
/// Returns an error if command execution fails.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_options = crate::logging::LogOptions {
        verbosity: cli.verbose,
        quiet: cli.quiet,
        json_file: cli.log_file.clone(),
    };
    if let Err(e) = crate::logging::init(&log_options) {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    match &cli.command {
        Commands::Import(args) => commands::import::execute(args, cli.json),
    }
}
