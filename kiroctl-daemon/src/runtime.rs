//! Foreground supervisor: run the backend (and optionally the frontend) as
//! owned children and tear everything down exactly once on the way out.
//!
//! ```text
//! Idle → EnvironmentReady → PortsReclaimed → Running → Cleaning → Terminated
//! ```
//!
//! `Running` ends on the first of: backend exit, SIGINT, SIGTERM. The
//! cleanup pass is ordered and failure tolerant; every step runs even when
//! an earlier one failed.

use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use kiroctl_core::{services, Host, Port, RunMode, Service, StackConfig};
use kiroctl_reconcile::{ensure_environment, kill_matching, reclaim, Confirm, EnvironmentReport};

use crate::error::{io_err, DaemonError};

/// How long an owned child gets between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// `kiroctl start` arguments after orchestrator flags are picked out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendArgs {
    /// `--port` / `-p`; drives reclamation and is forwarded.
    pub port: Option<u16>,
    /// `--host`; forwarded.
    pub host: Option<String>,
    /// `--no-ui`; never forwarded.
    pub no_ui: bool,
    /// Everything the backend receives, in order.
    pub forward: Vec<String>,
}

fn parse_port(value: &str) -> Result<u16, DaemonError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(DaemonError::InvalidArgument(format!(
            "'{value}' is not a valid port"
        ))),
    }
}

impl BackendArgs {
    /// Split raw `start` arguments. The last `--port` / `--host` wins.
    pub fn parse(args: &[String]) -> Result<Self, DaemonError> {
        let mut parsed = BackendArgs::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--no-ui" => {
                    parsed.no_ui = true;
                    continue;
                }
                "--port" | "-p" | "--host" => {
                    let value = iter.next().ok_or_else(|| {
                        DaemonError::InvalidArgument(format!("{arg} needs a value"))
                    })?;
                    if arg == "--host" {
                        parsed.host = Some(value.clone());
                    } else {
                        parsed.port = Some(parse_port(value)?);
                    }
                    parsed.forward.push(arg.clone());
                    parsed.forward.push(value.clone());
                    continue;
                }
                _ => {}
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port(value)?);
            } else if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(value.to_string());
            }
            parsed.forward.push(arg.clone());
        }
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    EnvironmentReady,
    PortsReclaimed,
    Running,
    Cleaning,
    Terminated,
}

/// Why `Running` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Backend(ExitStatus),
    Signal(Signal),
    /// The backend could not be waited on.
    WaitFailed,
}

impl ExitReason {
    /// The backend's own code, or `128 + signo`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Backend(status) => status
                .code()
                .or_else(|| status.signal().map(|signo| 128 + signo))
                .unwrap_or(1),
            ExitReason::Signal(signal) => 128 + *signal as i32,
            ExitReason::WaitFailed => 1,
        }
    }
}

/// One-shot latch guarding the cleanup pass.
#[derive(Debug, Default)]
pub struct Teardown {
    fired: AtomicBool,
}

impl Teardown {
    /// `true` for the first caller only.
    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor<'a> {
    host: &'a dyn Host,
    config: StackConfig,
    args: BackendArgs,
    state: SupervisorState,
    teardown: Teardown,
    backend: Option<Child>,
    frontend: Option<Child>,
    environment: Option<EnvironmentReport>,
    stop_grace: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(host: &'a dyn Host, config: &StackConfig, args: BackendArgs) -> Self {
        let mut config = config.clone();
        if args.no_ui {
            config.frontend.enabled = false;
        }
        Self {
            host,
            config,
            args,
            state: SupervisorState::Idle,
            teardown: Teardown::default(),
            backend: None,
            frontend: None,
            environment: None,
            stop_grace: STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::info!(from = ?self.state, to = ?next, "supervisor");
        self.state = next;
    }

    fn backend_port(&self) -> Port {
        let mut port = self.config.backend_port(RunMode::Foreground);
        if let Some(number) = self.args.port {
            port.number = number;
        }
        port
    }

    /// Reclaimed whenever the UI is wanted, even when it was never spawned.
    fn frontend_port(&self) -> Option<Port> {
        self.config
            .frontend
            .enabled
            .then(|| self.config.frontend_port())
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.reclaim_grace_ms)
    }

    /// `Idle → EnvironmentReady → PortsReclaimed`. Blocking.
    pub fn prepare(&mut self, prompt: &dyn Confirm) -> Result<EnvironmentReport, DaemonError> {
        let report = ensure_environment(self.host, &self.config, RunMode::Foreground, prompt)?;
        self.environment = Some(report.clone());
        self.transition(SupervisorState::EnvironmentReady);

        reclaim(self.host, &self.backend_port(), self.grace());
        if let Some(port) = self.frontend_port() {
            reclaim(self.host, &port, self.grace());
        }
        self.transition(SupervisorState::PortsReclaimed);
        Ok(report)
    }

    /// Without `--port` on the command line the configured port is passed
    /// explicitly, so the backend binds the port that was reclaimed.
    fn backend_service(&self) -> Service {
        let mut args = Vec::with_capacity(self.args.forward.len() + 2);
        if self.args.port.is_none() {
            args.push("--port".to_string());
            args.push(self.backend_port().number.to_string());
        }
        args.extend(self.args.forward.iter().cloned());
        services::backend_service(&self.config, RunMode::Foreground, &args)
    }

    fn spawn_frontend(&mut self) {
        let Some(npm) = self
            .environment
            .as_ref()
            .and_then(EnvironmentReport::frontend_npm)
            .map(|npm| npm.to_path_buf())
        else {
            return;
        };
        let service = services::frontend_service(&self.config, RunMode::Foreground, &npm);
        let mut cmd = command_for(&service);
        cmd.stdin(Stdio::null()).process_group(0);
        match cmd.spawn() {
            Ok(child) => {
                tracing::info!(pid = ?child.id(), port = service.port.number, "frontend started");
                self.frontend = Some(child);
            }
            Err(err) => {
                tracing::warn!(error = %err, "frontend failed to start; continuing backend-only");
            }
        }
    }

    fn spawn_backend(&mut self) -> Result<(), DaemonError> {
        let service = self.backend_service();
        let program = service.command.first().cloned().unwrap_or_default();
        let child = command_for(&service)
            .stdin(Stdio::inherit())
            .spawn()
            .map_err(|source| DaemonError::Spawn { program, source })?;
        tracing::info!(pid = ?child.id(), port = self.backend_port().number, "backend started");
        self.backend = Some(child);
        Ok(())
    }

    /// `PortsReclaimed → Running → Cleaning → Terminated`.
    ///
    /// `shutdown` resolves with the signal that asked us to stop. Returns the
    /// process exit code.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<i32, DaemonError>
    where
        F: Future<Output = Signal>,
    {
        self.spawn_frontend();
        if let Err(err) = self.spawn_backend() {
            self.cleanup().await;
            return Err(err);
        }
        self.transition(SupervisorState::Running);

        tokio::pin!(shutdown);
        let mut frontend_alive = self.frontend.is_some();
        let reason = loop {
            let backend = wait_child(&mut self.backend);
            let frontend = wait_child(&mut self.frontend);
            tokio::select! {
                status = backend => break match status {
                    Ok(status) => {
                        tracing::info!(code = ?status.code(), "backend exited");
                        ExitReason::Backend(status)
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "waiting for backend failed");
                        ExitReason::WaitFailed
                    }
                },
                signal = &mut shutdown => {
                    tracing::info!(signal = %signal, "received signal, shutting down");
                    break ExitReason::Signal(signal);
                }
                status = frontend, if frontend_alive => {
                    frontend_alive = false;
                    tracing::warn!(status = ?status.ok(), "frontend exited; backend keeps running");
                }
            }
        };

        self.cleanup().await;
        Ok(reason.exit_code())
    }

    /// The ordered cleanup pass. Runs at most once per supervisor.
    pub async fn cleanup(&mut self) {
        if !self.teardown.fire() {
            return;
        }
        self.transition(SupervisorState::Cleaning);

        if let Some(child) = self.backend.as_mut() {
            stop_child(child, "backend", false, self.stop_grace).await;
        }
        if let Some(child) = self.frontend.as_mut() {
            stop_child(child, "frontend", true, self.stop_grace).await;
        }
        if let Some(port) = self.frontend_port() {
            reclaim(self.host, &port, self.grace());
        }
        reclaim(self.host, &self.backend_port(), self.grace());
        let signature = format!(
            "{} {}",
            self.config.venv_python().display(),
            self.config.backend.entry
        );
        kill_matching(self.host, &signature, "backend");

        self.transition(SupervisorState::Terminated);
    }
}

fn command_for(service: &Service) -> Command {
    let mut cmd = Command::new(service.command.first().map(String::as_str).unwrap_or(""));
    cmd.args(service.command.iter().skip(1))
        .current_dir(&service.working_dir)
        .envs(&service.env)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

async fn wait_child(child: &mut Option<Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// SIGTERM, up to `grace` to exit, then SIGKILL. `group` signals the whole
/// process group the child leads.
async fn stop_child(child: &mut Child, label: &str, group: bool, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(label, code = ?status.code(), "already exited");
            return;
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(label, error = %err, "could not poll child"),
    }
    let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let pid = Pid::from_raw(raw);
    let send = |signal: Signal| {
        let result = if group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        if let Err(errno) = result {
            tracing::debug!(label, pid = raw, %signal, error = %errno, "signal not delivered");
        }
    };

    send(Signal::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(label, pid = raw, code = ?status.code(), "stopped");
        }
        Ok(Err(err)) => {
            tracing::warn!(label, pid = raw, error = %err, "waiting for child failed");
        }
        Err(_) => {
            tracing::warn!(label, pid = raw, "did not stop in time; killing");
            send(Signal::SIGKILL);
            if let Err(err) = child.wait().await {
                tracing::warn!(label, pid = raw, error = %err, "waiting for child failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// SIGINT or SIGTERM, whichever arrives first. Handlers are installed when
/// this is called, not when the future is first polled.
fn shutdown_signal() -> Result<impl Future<Output = Signal>, DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).map_err(DaemonError::Signals)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(DaemonError::Signals)?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => Signal::SIGINT,
            _ = terminate.recv() => Signal::SIGTERM,
        }
    })
}

/// Run the stack in the foreground and return the process exit code.
pub fn run_foreground(
    host: &dyn Host,
    config: &StackConfig,
    args: BackendArgs,
    prompt: &dyn Confirm,
) -> Result<i32, DaemonError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;

    let mut supervisor = Supervisor::new(host, config, args);
    supervisor.prepare(prompt)?;
    runtime.block_on(async {
        let shutdown = shutdown_signal()?;
        supervisor.run(shutdown).await
    })
}
