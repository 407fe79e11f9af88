//! optlearn CLI - Evaluate GPU Monte-Carlo Expected Improvement from a config file.
//!
//! # Commands
//!
//! - `optlearn evaluate --config <file>` - Evaluate EI (and its gradient)
//! - `optlearn devices` - List available compute devices
//!
//! # Examples
//!
//! ```bash
//! # Evaluate on the CPU emulation backend
//! optlearn evaluate --config configs/example.toml
//!
//! # Evaluate with gradient on the first CUDA device
//! optlearn evaluate --config configs/example.toml --backend cuda --gradient
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod error;

use commands::{devices, evaluate, BackendKind};

/// optlearn CLI - Monte-Carlo Expected Improvement tooling
#[derive(Parser)]
#[command(name = "optlearn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate expected improvement for the configured candidate batch
    Evaluate {
        /// TOML configuration file
        #[arg(short, long)]
        config: String,

        /// Compute backend
        #[arg(short, long, value_enum, default_value = "cpu")]
        backend: BackendKind,

        /// Also compute the gradient w.r.t. the candidates
        #[arg(short, long)]
        gradient: bool,
    },

    /// List available compute devices
    Devices,
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Evaluate {
            config,
            backend,
            gradient,
        } => evaluate::execute(&config, backend, gradient),

        Commands::Devices => devices::execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
