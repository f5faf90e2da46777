//! Stack configuration (`kiroctl.yaml`).
//!
//! # Storage layout
//!
//! ```text
//! <project_dir>/
//!   kiroctl.yaml        (optional: every field has a default)
//!   main.py             backend entry point
//!   requirements.txt    backend dependency manifest
//!   .env / .env.example configuration file and its template
//!   venv/               isolated runtime environment
//!   frontend/           optional frontend (npm) project
//! ```
//!
//! # API pattern
//!
//! Loading and saving take an explicit path (`load_at`, `save_at`) so tests
//! can point them at a `TempDir`. [`discover`] applies the CLI lookup rules.
//!
//! The resolved [`StackConfig`] is threaded through every component; nothing
//! in the workspace reads ports, paths or unit names from ambient globals.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{Port, RunMode, ServiceName, Version};

/// File name looked up in the project directory.
pub const CONFIG_FILE_NAME: &str = "kiroctl.yaml";

/// Label used for the backend port in logs and reports.
pub const BACKEND_PORT_LABEL: &str = "backend";
/// Label used for the frontend port in logs and reports.
pub const FRONTEND_PORT_LABEL: &str = "frontend-ui";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Root of `kiroctl.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Root of the application checkout. Relative values resolve against the
    /// directory holding the config file.
    pub project_dir: PathBuf,
    pub runtime: RuntimeConfig,
    pub backend: BackendConfig,
    pub frontend: FrontendConfig,
    pub service: ServiceConfig,
    pub firewall: FirewallConfig,
    /// Pause after force-killing port holders, in milliseconds.
    pub reclaim_grace_ms: u64,
    /// Directory of `.tera` files overriding the embedded unit templates,
    /// laid out like them: `backend.service.tera`, `_partials/hardening.tera`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter used to create the virtualenv.
    pub python: String,
    /// Lowest accepted interpreter version, e.g. `"3.10"`.
    pub min_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Script run by the venv interpreter.
    pub entry: String,
    /// Foreground default port.
    pub port: u16,
    /// Port baked into the daemon descriptor.
    pub daemon_port: u16,
    /// Virtualenv directory, relative to the project dir.
    pub venv: PathBuf,
    pub requirements: PathBuf,
    /// Modules that must import cleanly inside the venv.
    pub required_imports: Vec<String>,
    pub env_file: PathBuf,
    pub env_template: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub enabled: bool,
    /// Frontend project directory, relative to the project dir.
    pub dir: PathBuf,
    pub port: u16,
    pub npm: String,
    /// Bind address passed to the dev/preview server.
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub backend_unit: ServiceName,
    pub frontend_unit: ServiceName,
    pub unit_dir: PathBuf,
    pub restart_sec: u32,
    pub start_limit_interval_sec: u32,
    pub start_limit_burst: u32,
    /// How long `install` waits for each unit to report `active`.
    pub activation_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// iptables-save targets, first existing one wins.
    pub persist_paths: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            runtime: RuntimeConfig::default(),
            backend: BackendConfig::default(),
            frontend: FrontendConfig::default(),
            service: ServiceConfig::default(),
            firewall: FirewallConfig::default(),
            reclaim_grace_ms: 1000,
            template_dir: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            min_version: "3.10".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            entry: "main.py".to_string(),
            port: 8000,
            daemon_port: 9000,
            venv: PathBuf::from("venv"),
            requirements: PathBuf::from("requirements.txt"),
            required_imports: ["fastapi", "uvicorn", "httpx", "loguru", "dotenv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env_file: PathBuf::from(".env"),
            env_template: PathBuf::from(".env.example"),
        }
    }
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("frontend"),
            port: 8991,
            npm: "npm".to_string(),
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend_unit: ServiceName::from("kiro-gateway"),
            frontend_unit: ServiceName::from("kiro-gateway-ui"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            restart_sec: 5,
            start_limit_interval_sec: 60,
            start_limit_burst: 5,
            activation_timeout_secs: 10,
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            persist_paths: vec![
                PathBuf::from("/etc/iptables/rules.v4"),
                PathBuf::from("/etc/sysconfig/iptables"),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Derived paths and ports
// ---------------------------------------------------------------------------

impl StackConfig {
    fn project_path(&self, rel: &Path) -> PathBuf {
        self.project_dir.join(rel)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.project_path(&self.backend.venv)
    }

    pub fn venv_python(&self) -> PathBuf {
        self.venv_dir().join("bin").join("python")
    }

    pub fn venv_pip(&self) -> PathBuf {
        self.venv_dir().join("bin").join("pip")
    }

    pub fn requirements(&self) -> PathBuf {
        self.project_path(&self.backend.requirements)
    }

    pub fn backend_entry(&self) -> PathBuf {
        self.project_dir.join(&self.backend.entry)
    }

    pub fn env_file(&self) -> PathBuf {
        self.project_path(&self.backend.env_file)
    }

    pub fn env_template(&self) -> PathBuf {
        self.project_path(&self.backend.env_template)
    }

    pub fn frontend_dir(&self) -> PathBuf {
        self.project_path(&self.frontend.dir)
    }

    pub fn node_modules(&self) -> PathBuf {
        self.frontend_dir().join("node_modules")
    }

    /// `<unit_dir>/<name>.service`
    pub fn unit_path(&self, name: &ServiceName) -> PathBuf {
        self.service.unit_dir.join(name.unit())
    }

    /// Both managed unit names, backend first.
    pub fn service_names(&self) -> [&ServiceName; 2] {
        [&self.service.backend_unit, &self.service.frontend_unit]
    }

    /// Backend port for the given run mode.
    pub fn backend_port(&self, mode: RunMode) -> Port {
        let number = match mode {
            RunMode::Foreground => self.backend.port,
            RunMode::Daemon => self.backend.daemon_port,
        };
        Port::new(number, BACKEND_PORT_LABEL)
    }

    pub fn frontend_port(&self) -> Port {
        Port::new(self.frontend.port, FRONTEND_PORT_LABEL)
    }

    /// The ports the firewall is asked to open in daemon mode.
    pub fn daemon_ports(&self) -> Vec<Port> {
        vec![self.backend_port(RunMode::Daemon), self.frontend_port()]
    }

    pub fn min_runtime_version(&self) -> Result<Version, ConfigError> {
        Version::parse(&self.runtime.min_version).ok_or_else(|| ConfigError::Invalid {
            field: "runtime.min_version",
            reason: format!("'{}' is not a dotted version", self.runtime.min_version),
        })
    }

    /// Rejects values no component can act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.min_runtime_version()?;
        for (field, port) in [
            ("backend.port", self.backend.port),
            ("backend.daemon_port", self.backend.daemon_port),
            ("frontend.port", self.frontend.port),
        ] {
            if port == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "port 0 cannot be reclaimed or opened".to_string(),
                });
            }
        }
        if self.frontend.port == self.backend.port || self.frontend.port == self.backend.daemon_port
        {
            return Err(ConfigError::Invalid {
                field: "frontend.port",
                reason: format!("{} collides with a backend port", self.frontend.port),
            });
        }
        if self.service.backend_unit == self.service.frontend_unit {
            return Err(ConfigError::Invalid {
                field: "service.frontend_unit",
                reason: "backend and frontend units must have distinct names".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load a config file. Relative `project_dir` values resolve against the
/// file's parent directory.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(path: &Path) -> Result<StackConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let mut config: StackConfig = if contents.trim().is_empty() {
        StackConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };
    if config.project_dir.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.project_dir = base.join(&config.project_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Serialize `config` to `path`, creating parent directories.
pub fn save_at(path: &Path, config: &StackConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml).map_err(|e| io_err(path, e))
}

/// CLI lookup rules.
///
/// - `explicit` given → it must exist.
/// - otherwise `<project_dir>/kiroctl.yaml` if present.
/// - otherwise defaults rooted at `project_dir`.
///
/// An explicit `project_dir` always wins over the file's own value.
pub fn discover(
    project_dir: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<StackConfig, ConfigError> {
    let mut config = match explicit {
        Some(path) => load_at(path)?,
        None => {
            let base = project_dir.unwrap_or_else(|| Path::new("."));
            let candidate = base.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                load_at(&candidate)?
            } else {
                StackConfig {
                    project_dir: base.to_path_buf(),
                    ..StackConfig::default()
                }
            }
        }
    };
    if let Some(dir) = project_dir {
        config.project_dir = dir.to_path_buf();
    }
    config.project_dir = std::fs::canonicalize(&config.project_dir)
        .map_err(|e| io_err(&config.project_dir, e))?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
