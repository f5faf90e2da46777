//! Host capability detection for `kiroctl-detector`.
//!
//! Three probes, each re-run on every call (nothing is cached):
//!
//! - [`detect_runtime`]: the Python interpreter and its version gate.
//! - [`detect_toolchain`] / [`detect_frontend`]: `npm` and the frontend project.
//! - [`detect_firewall`]: which of firewalld, ufw, iptables is *active*.
//!
//! Checks are ordered by priority: the first active firewall wins, even when
//! several are installed.

use std::fs;
use std::io;
use std::path::PathBuf;

use kiroctl_core::{ConfigError, Host, StackConfig, Version};
use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A usable Python interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Absolute interpreter path when it could be resolved on `PATH`.
    pub path: Option<PathBuf>,
    pub version: Version,
}

/// The frontend package manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Absolute path to `npm`; daemon descriptors need it.
    pub npm: PathBuf,
    pub version: Option<Version>,
}

/// Frontend project layout as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendProject {
    pub dir: PathBuf,
    /// `node_modules/` already present.
    pub installed: bool,
    pub has_dev_script: bool,
    pub has_build_script: bool,
    pub has_preview_script: bool,
}

/// Firewall front-ends in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallKind {
    Firewalld,
    Ufw,
    Iptables,
}

impl FirewallKind {
    /// All variants in probe order.
    pub fn all() -> &'static [FirewallKind] {
        &[FirewallKind::Firewalld, FirewallKind::Ufw, FirewallKind::Iptables]
    }

    pub fn program(&self) -> &'static str {
        match self {
            FirewallKind::Firewalld => "firewall-cmd",
            FirewallKind::Ufw => "ufw",
            FirewallKind::Iptables => "iptables",
        }
    }
}

impl std::fmt::Display for FirewallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirewallKind::Firewalld => write!(f, "firewalld"),
            FirewallKind::Ufw => write!(f, "ufw"),
            FirewallKind::Iptables => write!(f, "iptables"),
        }
    }
}

/// Errors from host detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("{program} not found; install Python >= {min} and make sure `{program}` is on PATH")]
    RuntimeMissing { program: String, min: Version },

    #[error("{program} {found} is too old; install Python >= {min}")]
    RuntimeTooOld {
        program: String,
        found: Version,
        min: Version,
    },

    #[error("could not read a version from `{program} --version` output: {output:?}")]
    UnreadableVersion { program: String, output: String },

    #[error("failed to run {program}: {source}")]
    Probe {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Probe the configured interpreter and enforce the minimum version.
///
/// This is the one unconditionally fatal precondition of the orchestrator.
pub fn detect_runtime(host: &dyn Host, config: &StackConfig) -> Result<RuntimeInfo, DetectError> {
    let program = config.runtime.python.as_str();
    let min = config.min_runtime_version()?;

    let output = match host.run(program, &["--version"]) {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(DetectError::RuntimeMissing {
                program: program.to_string(),
                min,
            });
        }
        Err(source) => {
            return Err(DetectError::Probe {
                program: program.to_string(),
                source,
            });
        }
    };
    if !output.success() {
        return Err(DetectError::RuntimeMissing {
            program: program.to_string(),
            min,
        });
    }

    // Python 2 printed its banner on stderr.
    let banner = output.combined();
    let version = Version::find_in(&banner).ok_or_else(|| DetectError::UnreadableVersion {
        program: program.to_string(),
        output: banner.clone(),
    })?;

    if version < min {
        return Err(DetectError::RuntimeTooOld {
            program: program.to_string(),
            found: version,
            min,
        });
    }

    tracing::debug!(program, %version, "runtime ok");
    Ok(RuntimeInfo {
        path: host.which(program),
        version,
    })
}

// ---------------------------------------------------------------------------
// Frontend
// ---------------------------------------------------------------------------

/// `npm` if it is installed and answers `--version`. Absence is not an error.
pub fn detect_toolchain(host: &dyn Host, config: &StackConfig) -> Option<Toolchain> {
    let npm = host.which(&config.frontend.npm)?;
    let program = npm.display().to_string();
    match host.run(&program, &["--version"]) {
        Ok(output) if output.success() => Some(Toolchain {
            npm,
            version: Version::find_in(&output.stdout),
        }),
        Ok(output) => {
            tracing::debug!(npm = %program, code = ?output.code, "npm --version failed");
            None
        }
        Err(err) => {
            tracing::debug!(npm = %program, error = %err, "npm not runnable");
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: std::collections::BTreeMap<String, String>,
}

/// Inspect `<project>/frontend`. `Ok(None)` when there is no frontend project.
pub fn detect_frontend(config: &StackConfig) -> Result<Option<FrontendProject>, DetectError> {
    let dir = config.frontend_dir();
    let manifest = dir.join("package.json");
    if !manifest.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&manifest).map_err(|source| DetectError::Probe {
        program: manifest.display().to_string(),
        source,
    })?;
    let package: PackageJson =
        serde_json::from_str(&content).map_err(|e| DetectError::ParseError {
            path: manifest.clone(),
            message: e.to_string(),
        })?;

    Ok(Some(FrontendProject {
        installed: config.node_modules().is_dir(),
        has_dev_script: package.scripts.contains_key("dev"),
        has_build_script: package.scripts.contains_key("build"),
        has_preview_script: package.scripts.contains_key("preview"),
        dir,
    }))
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

/// The first *active* firewall in priority order, or `None`.
///
/// Installed-but-inactive front-ends are skipped: firewalld must be the
/// running systemd service, ufw must report `Status: active`, iptables must
/// answer a rule listing.
pub fn detect_firewall(host: &dyn Host) -> Option<FirewallKind> {
    FirewallKind::all()
        .iter()
        .copied()
        .find(|kind| firewall_active(host, *kind))
}

fn firewall_active(host: &dyn Host, kind: FirewallKind) -> bool {
    if host.which(kind.program()).is_none() {
        return false;
    }
    let active = match kind {
        FirewallKind::Firewalld => host
            .run("systemctl", &["is-active", "firewalld"])
            .map(|out| out.stdout.trim() == "active")
            .unwrap_or(false),
        FirewallKind::Ufw => host
            .run("ufw", &["status"])
            .map(|out| out.success() && is_ufw_active(&out.stdout))
            .unwrap_or(false),
        FirewallKind::Iptables => host
            .run("iptables", &["-S", "INPUT"])
            .map(|out| out.success())
            .unwrap_or(false),
    };
    tracing::debug!(firewall = %kind, active, "firewall probe");
    active
}

fn is_ufw_active(status: &str) -> bool {
    status
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("status: active"))
}
