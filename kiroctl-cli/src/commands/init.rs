//! `kiroctl init [--force]`

use anyhow::{bail, Context, Result};
use clap::Args;

use kiroctl_core::config::{self, CONFIG_FILE_NAME};
use kiroctl_core::StackConfig;

use crate::ui;
use crate::GlobalArgs;

/// Write a default kiroctl.yaml into the project directory.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing kiroctl.yaml.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let dir = global
            .project_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let path = global
            .config
            .clone()
            .unwrap_or_else(|| dir.join(CONFIG_FILE_NAME));
        if path.exists() && !self.force {
            bail!(
                "{} already exists; pass --force to overwrite it",
                path.display()
            );
        }

        // Relative so the file stays valid if the checkout moves.
        let defaults = StackConfig {
            project_dir: std::path::PathBuf::from("."),
            ..StackConfig::default()
        };
        config::save_at(&path, &defaults)
            .with_context(|| format!("failed to write {}", path.display()))?;

        ui::ok(&format!("Wrote {}", path.display()));
        Ok(())
    }
}
