//! Domain types for the kiroctl stack.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed service (systemd unit) name, without the `.service` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(pub String);

impl ServiceName {
    /// Unit file name as systemd knows it (`<name>.service`).
    pub fn unit(&self) -> String {
        format!("{}.service", self.0)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ServiceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServiceName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A TCP port plus the label used when logging about it.
///
/// Ports are never owned by the orchestrator; they are reconciliation keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub label: String,
}

impl Port {
    pub fn new(number: u16, label: impl Into<String>) -> Self {
        Self {
            number,
            label: label.into(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number, self.label)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How the stack's processes are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Children of the orchestrator; stop when it stops.
    #[default]
    Foreground,
    /// Registered with systemd; survive the orchestrator.
    Daemon,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Foreground => write!(f, "foreground"),
            RunMode::Daemon => write!(f, "daemon"),
        }
    }
}

/// The two processes making up the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Backend,
    Frontend,
}

impl Component {
    /// Stable order: backend first, frontend depends on it.
    pub fn all() -> &'static [Component] {
        &[Component::Backend, Component::Frontend]
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Backend => write!(f, "backend"),
            Component::Frontend => write!(f, "frontend"),
        }
    }
}

/// Restart behaviour rendered into the service descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    /// Restart after `delay_sec`, at most `burst` times per `interval_sec`.
    OnFailure {
        delay_sec: u32,
        interval_sec: u32,
        burst: u32,
    },
}

impl RestartPolicy {
    /// systemd `Restart=` value.
    pub fn systemd_value(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "no",
            RestartPolicy::OnFailure { .. } => "on-failure",
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure {
            delay_sec: 5,
            interval_sec: 60,
            burst: 5,
        }
    }
}

/// A dotted `major.minor[.patch]` version, compared numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the first dotted version found in `text` (`"Python 3.11.4"` → 3.11.4).
    ///
    /// Pre-release suffixes such as `3.13.0rc1` are cut at the first non-digit.
    pub fn find_in(text: &str) -> Option<Self> {
        text.split_whitespace()
            .find_map(|word| Self::parse(word.trim_start_matches('v')))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        let patch = parts.next().and_then(leading_number).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// The (non-elevated) account daemon services run as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub user: String,
    pub group: String,
}

/// A process the orchestrator decided must run. Identity = `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: ServiceName,
    pub component: Component,
    pub description: String,
    /// argv; `command[0]` is an absolute path in daemon mode.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional `KEY=VALUE` file; a missing file is tolerated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<PathBuf>,
    pub restart: RestartPolicy,
    pub mode: RunMode,
    pub port: Port,
    /// Units this one is ordered after (besides the network target).
    #[serde(default)]
    pub after: Vec<String>,
}

impl Service {
    /// `command` joined for an `ExecStart=` line, quoting arguments with whitespace.
    pub fn exec_line(&self) -> String {
        self.command
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"') {
                    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
