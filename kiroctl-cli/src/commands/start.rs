//! `kiroctl start`: foreground supervision.

use anyhow::{Context, Result};
use clap::Args;

use kiroctl_core::SystemHost;
use kiroctl_daemon::{run_foreground, BackendArgs};

use crate::ui::{self, TerminalPrompt};
use crate::GlobalArgs;

/// Arguments for `kiroctl start`. Anything not recognised here is passed to
/// the backend unchanged.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Backend port (default 8000). Also forwarded to the backend.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Backend bind address, forwarded to the backend.
    #[arg(long)]
    pub host: Option<String>,

    /// Do not start the web UI.
    #[arg(long)]
    pub no_ui: bool,

    /// Extra backend arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

impl StartArgs {
    /// Flags clap picked out, put back in front of the trailing arguments.
    fn raw(&self) -> Vec<String> {
        let mut raw = Vec::with_capacity(self.args.len() + 5);
        if let Some(port) = self.port {
            raw.push("--port".to_string());
            raw.push(port.to_string());
        }
        if let Some(host) = &self.host {
            raw.push("--host".to_string());
            raw.push(host.clone());
        }
        if self.no_ui {
            raw.push("--no-ui".to_string());
        }
        raw.extend(self.args.iter().cloned());
        raw
    }

    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.load()?;
        let args = BackendArgs::parse(&self.raw()).context("invalid start arguments")?;

        ui::step(&format!("Starting stack in {}", config.project_dir.display()));
        let code = run_foreground(&SystemHost, &config, args, &TerminalPrompt)
            .context("foreground run failed")?;
        if code == 0 {
            ui::ok("backend exited cleanly");
            return Ok(());
        }
        tracing::warn!(code, "backend exited with a failure status");
        std::process::exit(code);
    }
}
