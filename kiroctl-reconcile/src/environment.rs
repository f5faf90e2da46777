//! Environment reconciliation: bring the project checkout to a runnable state.
//!
//! Steps, in order:
//!
//! 1. Runtime gate (fatal when missing or too old).
//! 2. `.env` seeding from `.env.example`; in the foreground the operator must
//!    acknowledge the fresh file before anything is started.
//! 3. Virtualenv: create when missing, reuse otherwise.
//! 4. Required imports; any failure installs the whole requirements manifest.
//! 5. Frontend: `npm install` when `node_modules/` is missing, plus
//!    `npm run build` in daemon mode. Every frontend problem degrades to
//!    backend-only with a warning.

use std::io;
use std::path::{Path, PathBuf};

use kiroctl_core::{Host, HostCommand, RunMode, StackConfig};
use kiroctl_detector::{detect_frontend, detect_runtime, detect_toolchain, RuntimeInfo};

use crate::error::{io_err, ReconcileError};

// ---------------------------------------------------------------------------
// Confirmation prompt
// ---------------------------------------------------------------------------

/// The one interactive suspension point. Returns whether to continue.
pub trait Confirm {
    fn confirm(&self, message: &str) -> bool;
}

/// Non-interactive [`Confirm`] that always continues.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenvState {
    Created,
    Reused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Satisfied,
    Installed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFileState {
    Present,
    /// Copied from the template during this run.
    Seeded,
    /// Neither file exists (daemon mode only; the unit tolerates it).
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendState {
    /// Turned off by configuration or `--no-ui`.
    Disabled,
    /// Wanted but not runnable; the reason is user-facing.
    Unavailable(String),
    Ready {
        npm: PathBuf,
        /// `npm install` ran during this pass.
        installed: bool,
        /// `npm run build` ran during this pass.
        built: bool,
    },
}

/// Everything [`ensure_environment`] checked or changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentReport {
    pub mode: RunMode,
    pub runtime: RuntimeInfo,
    pub venv: VenvState,
    pub dependencies: DependencyState,
    pub config_file: ConfigFileState,
    pub frontend: FrontendState,
}

impl EnvironmentReport {
    /// Absolute `npm` when the frontend can run.
    pub fn frontend_npm(&self) -> Option<&Path> {
        match &self.frontend {
            FrontendState::Ready { npm, .. } => Some(npm),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ensure_environment
// ---------------------------------------------------------------------------

/// Reconcile the project environment for `mode`.
///
/// Errors are fatal preconditions; everything degradable is reported in the
/// returned [`EnvironmentReport`] instead.
pub fn ensure_environment(
    host: &dyn Host,
    config: &StackConfig,
    mode: RunMode,
    prompt: &dyn Confirm,
) -> Result<EnvironmentReport, ReconcileError> {
    let runtime = detect_runtime(host, config)?;
    tracing::info!(version = %runtime.version, "runtime ok");

    let config_file = ensure_config_file(config, mode, prompt)?;
    let venv = ensure_venv(host, config)?;
    let dependencies = ensure_dependencies(host, config)?;
    let frontend = ensure_frontend(host, config, mode);

    Ok(EnvironmentReport {
        mode,
        runtime,
        venv,
        dependencies,
        config_file,
        frontend,
    })
}

fn ensure_config_file(
    config: &StackConfig,
    mode: RunMode,
    prompt: &dyn Confirm,
) -> Result<ConfigFileState, ReconcileError> {
    let path = config.env_file();
    if path.exists() {
        return Ok(ConfigFileState::Present);
    }

    let template = config.env_template();
    if !template.exists() {
        return match mode {
            RunMode::Foreground => Err(ReconcileError::TemplateMissing { path, template }),
            RunMode::Daemon => {
                tracing::warn!(path = %path.display(), "no configuration file; services start without it");
                Ok(ConfigFileState::Absent)
            }
        };
    }

    std::fs::copy(&template, &path).map_err(|e| io_err(&path, e))?;
    tracing::info!(path = %path.display(), template = %template.display(), "seeded configuration file");

    if mode == RunMode::Foreground {
        let message = format!(
            "{} was created from {}. Edit it now, then continue?",
            path.display(),
            template.display()
        );
        if !prompt.confirm(&message) {
            return Err(ReconcileError::Declined { path });
        }
    }
    Ok(ConfigFileState::Seeded)
}

fn ensure_venv(host: &dyn Host, config: &StackConfig) -> Result<VenvState, ReconcileError> {
    let venv = config.venv_dir();
    if config.venv_python().exists() {
        tracing::debug!(path = %venv.display(), "reusing virtualenv");
        return Ok(VenvState::Reused);
    }

    tracing::info!(path = %venv.display(), "creating virtualenv");
    let cmd = HostCommand::new(config.runtime.python.as_str())
        .args(["-m", "venv"])
        .arg(venv.display().to_string())
        .current_dir(&config.project_dir);
    let output = host.exec(&cmd).map_err(|source| ReconcileError::Spawn {
        program: config.runtime.python.clone(),
        source,
    })?;
    if !output.success() {
        return Err(ReconcileError::VenvCreate {
            path: venv,
            detail: output.combined(),
        });
    }
    Ok(VenvState::Created)
}

fn imports_resolve(host: &dyn Host, config: &StackConfig) -> bool {
    if config.backend.required_imports.is_empty() {
        return true;
    }
    let statement = format!("import {}", config.backend.required_imports.join(", "));
    let cmd = HostCommand::new(config.venv_python().display().to_string())
        .args(["-c", statement.as_str()])
        .current_dir(&config.project_dir);
    match host.exec(&cmd) {
        Ok(output) if output.success() => true,
        Ok(output) => {
            tracing::info!(missing = %output.stderr.trim(), "backend dependencies incomplete");
            false
        }
        Err(err) => {
            tracing::warn!(error = %err, "could not run the virtualenv interpreter");
            false
        }
    }
}

fn ensure_dependencies(
    host: &dyn Host,
    config: &StackConfig,
) -> Result<DependencyState, ReconcileError> {
    if imports_resolve(host, config) {
        return Ok(DependencyState::Satisfied);
    }

    let manifest = config.requirements();
    tracing::info!(manifest = %manifest.display(), "installing backend dependencies");
    let pip = config.venv_pip().display().to_string();
    let cmd = HostCommand::new(pip.as_str())
        .args(["install", "-r"])
        .arg(manifest.display().to_string())
        .current_dir(&config.project_dir)
        .inherit_stdio();
    let output = host
        .exec(&cmd)
        .map_err(|source| ReconcileError::Spawn { program: pip, source })?;
    if !output.success() {
        return Err(ReconcileError::DependencyInstall {
            manifest,
            detail: match output.code {
                Some(code) => format!("pip exited with {code}"),
                None => "pip was killed by a signal".to_string(),
            },
        });
    }
    Ok(DependencyState::Installed)
}

fn unavailable(reason: impl Into<String>) -> FrontendState {
    let reason = reason.into();
    tracing::warn!(reason = %reason, "frontend unavailable; continuing backend-only");
    FrontendState::Unavailable(reason)
}

fn npm_step(host: &dyn Host, npm: &Path, dir: &Path, args: &[&str]) -> io::Result<bool> {
    let cmd = HostCommand::new(npm.display().to_string())
        .args(args.iter().copied())
        .current_dir(dir)
        .inherit_stdio();
    host.exec(&cmd).map(|out| out.success())
}

fn ensure_frontend(host: &dyn Host, config: &StackConfig, mode: RunMode) -> FrontendState {
    if !config.frontend.enabled {
        return FrontendState::Disabled;
    }

    let project = match detect_frontend(config) {
        Ok(Some(project)) => project,
        Ok(None) => {
            return unavailable(format!(
                "no frontend project at {}",
                config.frontend_dir().display()
            ))
        }
        Err(err) => return unavailable(err.to_string()),
    };
    let Some(toolchain) = detect_toolchain(host, config) else {
        return unavailable(format!("{} not found on PATH", config.frontend.npm));
    };
    let npm = toolchain.npm;

    let mut installed = false;
    if !project.installed {
        tracing::info!(dir = %project.dir.display(), "installing frontend dependencies");
        match npm_step(host, &npm, &project.dir, &["install"]) {
            Ok(true) => installed = true,
            Ok(false) => return unavailable("npm install failed"),
            Err(err) => return unavailable(format!("npm install: {err}")),
        }
    }

    let mut built = false;
    match mode {
        RunMode::Foreground => {
            if !project.has_dev_script {
                return unavailable("package.json has no `dev` script");
            }
        }
        RunMode::Daemon => {
            if !project.has_build_script {
                return unavailable("package.json has no `build` script");
            }
            tracing::info!(dir = %project.dir.display(), "building frontend");
            match npm_step(host, &npm, &project.dir, &["run", "build"]) {
                Ok(true) => built = true,
                Ok(false) => return unavailable("npm run build failed"),
                Err(err) => return unavailable(format!("npm run build: {err}")),
            }
        }
    }

    FrontendState::Ready {
        npm,
        installed,
        built,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiroctl_core::fake::FakeHost;
    use kiroctl_core::CommandOutput;
    use tempfile::TempDir;

    #[test]
    fn disabled_frontend_probes_nothing() {
        let host = FakeHost::new();
        let mut config = StackConfig::default();
        config.frontend.enabled = false;
        assert_eq!(
            ensure_frontend(&host, &config, RunMode::Daemon),
            FrontendState::Disabled
        );
        assert!(host.calls().is_empty());
    }

    #[test]
    fn empty_import_list_is_satisfied_without_exec() {
        let host = FakeHost::new();
        let mut config = StackConfig::default();
        config.backend.required_imports.clear();
        assert!(imports_resolve(&host, &config));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn import_statement_names_every_module() {
        let dir = TempDir::new().unwrap();
        let config = StackConfig {
            project_dir: dir.path().to_path_buf(),
            ..StackConfig::default()
        };
        let python = config.venv_python().display().to_string();
        let host = FakeHost::new();
        host.on(&python, |_| CommandOutput::ok(""));
        assert!(imports_resolve(&host, &config));
        assert_eq!(
            host.calls_to(&python),
            vec![vec!["-c", "import fastapi, uvicorn, httpx, loguru, dotenv"]]
        );
    }
}
