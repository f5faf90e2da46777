//! The host seam: every external effect the orchestrator has goes through
//! [`Host`]: running host programs, signalling PIDs, privilege checks.
//!
//! [`SystemHost`] is the real implementation. Tests use the scripted
//! `FakeHost` from [`crate::fake`] (feature `test-support`).

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Group, Pid, Uid, User};

use crate::types::ServiceIdentity;

// ---------------------------------------------------------------------------
// HostCommand / CommandOutput
// ---------------------------------------------------------------------------

/// A host program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Stream output to the terminal instead of capturing it.
    pub inherit_stdio: bool,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            inherit_stdio: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn inherit_stdio(mut self) -> Self {
        self.inherit_stdio = true;
        self
    }

    /// `program arg1 arg2` for log lines.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished [`HostCommand`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, trimmed. Firewall tools print their
    /// "already enabled" notices on either stream.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Everything the orchestrator does to the machine it runs on.
pub trait Host: Send + Sync {
    /// Run `cmd` to completion. `Err` with `ErrorKind::NotFound` means the
    /// program is not installed.
    fn exec(&self, cmd: &HostCommand) -> io::Result<CommandOutput>;

    /// Deliver `signal` to `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno>;

    /// Whether the effective user is root.
    fn is_elevated(&self) -> bool;

    /// Environment lookup (kept on the seam so tests can script `SUDO_USER`).
    fn env_var(&self, key: &str) -> Option<String>;

    /// Absolute path of `program` on `PATH`.
    fn which(&self, program: &str) -> Option<PathBuf>;

    /// Primary group of `user`, if the account exists.
    fn primary_group(&self, user: &str) -> Option<String>;

    /// Name of the account the orchestrator runs as.
    fn current_user(&self) -> Option<String>;

    /// PID of the orchestrator itself; never signalled by reclamation.
    fn own_pid(&self) -> u32 {
        std::process::id()
    }

    /// Convenience: run `program args...` with captured output.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        self.exec(&HostCommand::new(program).args(args.iter().copied()))
    }
}

/// The non-elevated account services should run as: `SUDO_USER` when the
/// orchestrator was started through sudo, the current user otherwise.
pub fn invoking_identity(host: &dyn Host) -> Option<ServiceIdentity> {
    let user = host
        .env_var("SUDO_USER")
        .filter(|u| !u.is_empty() && u != "root")
        .or_else(|| host.current_user())?;
    let group = host.primary_group(&user).unwrap_or_else(|| user.clone());
    Some(ServiceIdentity { user, group })
}

// ---------------------------------------------------------------------------
// SystemHost
// ---------------------------------------------------------------------------

/// [`Host`] backed by the real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn exec(&self, cmd: &HostCommand) -> io::Result<CommandOutput> {
        tracing::debug!(command = %cmd.display(), "exec");
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).stdin(Stdio::null());
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        if cmd.inherit_stdio {
            let status = command
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()?;
            return Ok(CommandOutput {
                code: status.code(),
                ..CommandOutput::default()
            });
        }

        let output = command.output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
        let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
        kill(Pid::from_raw(raw), signal)
    }

    fn is_elevated(&self) -> bool {
        Uid::effective().is_root()
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            return is_executable(candidate).then(|| candidate.to_path_buf());
        }
        let path: OsString = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|full| is_executable(full))
    }

    fn primary_group(&self, user: &str) -> Option<String> {
        let account = User::from_name(user).ok().flatten()?;
        Group::from_gid(account.gid)
            .ok()
            .flatten()
            .map(|group| group.name)
    }

    fn current_user(&self) -> Option<String> {
        User::from_uid(Uid::current())
            .ok()
            .flatten()
            .map(|account| account.name)
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
