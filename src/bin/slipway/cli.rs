//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Slipway - an incremental build engine
#[derive(Parser)]
#[command(name = "slipway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Suppress command status output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose output (debug/info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a target from a build manifest
    Build(BuildArgs),
}

#[derive(Args)]
pub struct BuildArgs {
    /// The target to build
    pub target: String,

    /// Path to the build manifest
    #[arg(short, long, default_value = "build.toml")]
    pub file: PathBuf,

    /// Path to the build database (omit to rebuild from scratch)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Record an execution trace to this file
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Number of parallel jobs (0 = number of cores)
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,

    /// Change to this directory before building
    #[arg(short = 'C', long)]
    pub chdir: Option<PathBuf>,

    /// Client name the manifest must declare
    #[arg(long, default_value = "basic")]
    pub client: String,

    /// Client version the manifest must declare
    #[arg(long, default_value_t = 0)]
    pub client_version: u32,
}
