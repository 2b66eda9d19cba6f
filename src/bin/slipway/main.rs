//! The slipway command-line driver.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use slipway::buildsystem::console::ConsoleDelegate;
use slipway::buildsystem::system::BuildSystem;

mod cli;

use cli::{BuildArgs, Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let quiet = cli.quiet;
    match cli.command {
        Commands::Build(args) => run_build(quiet, &args),
    }
}

fn run_build(quiet: bool, args: &BuildArgs) -> ExitCode {
    if let Some(dir) = &args.chdir {
        if let Err(error) = std::env::set_current_dir(dir) {
            eprintln!("error: cannot change to '{}': {error}", dir.display());
            return ExitCode::FAILURE;
        }
    }

    let delegate = Arc::new(
        ConsoleDelegate::new(args.client.as_str(), args.client_version)
            .jobs(args.jobs)
            .quiet(quiet),
    );
    let mut system = BuildSystem::new(delegate.clone(), &args.file);

    if let Some(db) = &args.db {
        if let Err(error) = system.attach_db(db) {
            eprintln!("error: {error:#}");
            return ExitCode::FAILURE;
        }
    }
    if let Some(trace) = &args.trace {
        if let Err(error) = system.enable_tracing(trace) {
            eprintln!("error: {error:#}");
            return ExitCode::FAILURE;
        }
    }

    let ok = system.build(&args.target);
    if !ok || delegate.error_count() > 0 || delegate.had_failure() {
        if !quiet {
            eprintln!(
                "build failed ({} error(s))",
                delegate.error_count().max(1)
            );
        }
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
