//! kiroctl: run the Kiro gateway stack in the foreground or as systemd services.
//!
//! # Usage
//!
//! ```text
//! kiroctl start [--port P|-p P] [--host H] [--no-ui] [ARGS...]
//! kiroctl service [--uninstall | --status | --logs [N] | --dry-run]
//! kiroctl init [--force]
//!
//! global: --project-dir <DIR>  --config <FILE>
//! ```

mod commands;
mod ui;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use commands::{init::InitArgs, service::ServiceArgs, start::StartArgs};
use kiroctl_core::{config, StackConfig};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "kiroctl",
    version,
    about = "Start, install and supervise the Kiro gateway backend and its web UI",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Application checkout to operate on (default: current directory).
    #[arg(long, global = true, value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Configuration file (default: <project-dir>/kiroctl.yaml if present).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Resolve the stack configuration from the flags.
    pub fn load(&self) -> Result<StackConfig> {
        let config = config::discover(self.project_dir.as_deref(), self.config.as_deref())
            .context("failed to load kiroctl configuration")?;
        tracing::debug!(project = %config.project_dir.display(), "configuration loaded");
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run backend (and frontend) in the foreground until Ctrl-C.
    Start(StartArgs),

    /// Install, inspect or remove the systemd services.
    Service(ServiceArgs),

    /// Write a default kiroctl.yaml into the project directory.
    Init(InitArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Commands::Start(args) => args.run(&cli.global),
        Commands::Service(args) => args.run(&cli.global),
        Commands::Init(args) => args.run(&cli.global),
    }
}
