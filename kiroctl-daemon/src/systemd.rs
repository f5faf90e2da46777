//! Persistent (systemd) service management.
//!
//! Every operation re-probes the host: whether a descriptor exists, whether
//! the unit is enabled, whether it is active. Nothing is cached between runs,
//! so each sub-operation can be invoked on its own and repeated safely.
//!
//! Mutating steps inside [`install`] and [`uninstall`] are recorded in the
//! returned report; a failed step is logged and the sequence continues.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use kiroctl_core::host::invoking_identity;
use kiroctl_core::{
    services, Component, Host, Port, RunMode, ServiceIdentity, ServiceName, StackConfig,
};
use kiroctl_detector::{detect_frontend, detect_toolchain};
use kiroctl_reconcile::{
    close_ports, ensure_environment, open_ports, reclaim, remove_unit, unit_diff, write_unit,
    AssumeYes,
    EnvironmentReport, FileDiff, FirewallReport, FrontendState, WriteResult,
};
use kiroctl_renderer::{RenderedUnit, UnitRenderer};

use crate::error::DaemonError;

/// Poll interval while waiting for a unit to become active.
const ACTIVATION_POLL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// systemctl
// ---------------------------------------------------------------------------

/// Run `systemctl <args>`. `Err` carries a printable reason.
fn run_systemctl(host: &dyn Host, args: &[&str], ignore_failure: bool) -> Result<String, String> {
    let output = host
        .run("systemctl", args)
        .map_err(|e| format!("systemctl {}: {e}", args.join(" ")))?;
    if output.success() || ignore_failure {
        return Ok(output.stdout);
    }
    Err(format!(
        "systemctl {} failed (status {:?}): {}",
        args.join(" "),
        output.code,
        output.combined()
    ))
}

fn probe_word(host: &dyn Host, verb: &str, unit: &str) -> String {
    run_systemctl(host, &[verb, unit], true)
        .map(|out| out.trim().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Installation state
// ---------------------------------------------------------------------------

/// Derived, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitState {
    pub name: ServiceName,
    pub descriptor: PathBuf,
    pub descriptor_present: bool,
    pub enabled: bool,
    pub active: bool,
}

/// Probe one managed unit. Units without a descriptor are not queried.
pub fn probe(host: &dyn Host, config: &StackConfig, name: &ServiceName) -> UnitState {
    query_unit(host, config, name, false)
}

/// Like [`probe`], but asks systemd even when the descriptor is gone: a unit
/// whose file was deleted by hand can still be loaded and running.
fn probe_loaded(host: &dyn Host, config: &StackConfig, name: &ServiceName) -> UnitState {
    query_unit(host, config, name, true)
}

fn query_unit(
    host: &dyn Host,
    config: &StackConfig,
    name: &ServiceName,
    without_descriptor: bool,
) -> UnitState {
    let descriptor = config.unit_path(name);
    let descriptor_present = descriptor.exists();
    let unit = name.unit();
    let (enabled, active) = if descriptor_present || without_descriptor {
        (
            probe_word(host, "is-enabled", &unit) == "enabled",
            probe_word(host, "is-active", &unit) == "active",
        )
    } else {
        (false, false)
    };
    UnitState {
        name: name.clone(),
        descriptor,
        descriptor_present,
        enabled,
        active,
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

/// One logged step of an install or uninstall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub name: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Default)]
struct StepLog {
    steps: Vec<Step>,
}

impl StepLog {
    fn record(&mut self, name: impl Into<String>, result: Result<(), String>) {
        let name = name.into();
        let outcome = match result {
            Ok(()) => {
                tracing::info!(step = %name, "done");
                StepOutcome::Done
            }
            Err(reason) => {
                tracing::warn!(step = %name, reason = %reason, "step failed; continuing");
                StepOutcome::Failed(reason)
            }
        };
        self.steps.push(Step { name, outcome });
    }

    fn skip(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let name = name.into();
        let reason = reason.into();
        tracing::info!(step = %name, reason = %reason, "skipped");
        self.steps.push(Step {
            name,
            outcome: StepOutcome::Skipped(reason),
        });
    }
}

fn any_failed(steps: &[Step]) -> bool {
    steps
        .iter()
        .any(|s| matches!(s.outcome, StepOutcome::Failed(_)))
}

/// What [`install`] did.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub identity: ServiceIdentity,
    pub environment: EnvironmentReport,
    pub units: Vec<WriteResult>,
    pub firewall: FirewallReport,
    pub steps: Vec<Step>,
    /// Final `is-active` answer per installed unit.
    pub active: Vec<(ServiceName, bool)>,
}

impl InstallReport {
    pub fn succeeded(&self) -> bool {
        !any_failed(&self.steps) && self.active.iter().all(|(_, active)| *active)
    }
}

/// What [`uninstall`] did.
#[derive(Debug, Clone)]
pub struct UninstallReport {
    pub removed: Vec<PathBuf>,
    pub firewall: FirewallReport,
    pub steps: Vec<Step>,
}

impl UninstallReport {
    pub fn succeeded(&self) -> bool {
        !any_failed(&self.steps)
    }
}

/// One row of [`status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub component: Component,
    pub state: UnitState,
    pub port: Port,
    /// `systemctl status` output; `None` when no descriptor exists.
    pub detail: Option<String>,
}

/// What [`plan`] would change.
#[derive(Debug, Clone)]
pub struct Plan {
    pub identity: ServiceIdentity,
    pub diffs: Vec<FileDiff>,
    pub unchanged: Vec<PathBuf>,
    /// Why the frontend descriptor is not part of the plan, if it is not.
    pub frontend_skipped: Option<String>,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Descriptors for the daemon stack. The frontend is included only when an
/// absolute `npm` is known.
pub fn desired_units(
    config: &StackConfig,
    identity: &ServiceIdentity,
    npm: Option<&Path>,
) -> Result<Vec<RenderedUnit>, DaemonError> {
    let renderer = UnitRenderer::new(config.template_dir.as_deref())?;
    let mut wanted = vec![services::backend_service(config, RunMode::Daemon, &[])];
    if let Some(npm) = npm {
        wanted.push(services::frontend_service(config, RunMode::Daemon, npm));
    }
    wanted
        .iter()
        .map(|service| {
            renderer
                .render(service, identity, &config.service.unit_dir)
                .map_err(DaemonError::from)
        })
        .collect()
}

fn resolve_identity(host: &dyn Host) -> Result<ServiceIdentity, DaemonError> {
    invoking_identity(host).ok_or(DaemonError::IdentityUnresolved)
}

fn wait_active(host: &dyn Host, unit: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe_word(host, "is-active", unit) == "active" {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(ACTIVATION_POLL);
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Install (or refresh) both services and start them.
///
/// Fatal only when not root, when the service account cannot be resolved,
/// or when the environment has an unrecoverable precondition failure.
pub fn install(host: &dyn Host, config: &StackConfig) -> Result<InstallReport, DaemonError> {
    if !host.is_elevated() {
        return Err(DaemonError::NotElevated);
    }
    let identity = resolve_identity(host)?;
    tracing::info!(user = %identity.user, group = %identity.group, "installing services");
    let mut log = StepLog::default();

    for name in config.service_names() {
        let unit = name.unit();
        log.record(
            format!("stop {unit}"),
            run_systemctl(host, &["stop", &unit], true).map(|_| ()),
        );
    }

    let environment = ensure_environment(host, config, RunMode::Daemon, &AssumeYes)?;
    match &environment.frontend {
        FrontendState::Ready { .. } => {}
        FrontendState::Disabled => log.skip("frontend", "disabled"),
        FrontendState::Unavailable(reason) => log.skip("frontend", reason.as_str()),
    }

    let rendered = desired_units(config, &identity, environment.frontend_npm())?;
    let mut units = Vec::with_capacity(rendered.len());
    for unit in &rendered {
        match write_unit(&unit.path, &unit.content) {
            Ok(result) => {
                log.record(format!("write {}", unit.path.display()), Ok(()));
                units.push(result);
            }
            Err(err) => log.record(format!("write {}", unit.path.display()), Err(err.to_string())),
        }
    }

    log.record(
        "daemon-reload",
        run_systemctl(host, &["daemon-reload"], false).map(|_| ()),
    );

    let installed: Vec<ServiceName> = config
        .service_names()
        .into_iter()
        .take(rendered.len())
        .cloned()
        .collect();
    let mut ports = vec![config.backend_port(RunMode::Daemon)];
    if installed.len() > 1 {
        ports.push(config.frontend_port());
    }
    let firewall = open_ports(host, config, &ports);

    // A leftover holder makes the restarted unit crash-loop.
    let grace = Duration::from_millis(config.reclaim_grace_ms);
    for port in &ports {
        let result = reclaim(host, port, grace);
        tracing::debug!(port = port.number, ?result, "port reclaimed");
        log.record(format!("reclaim port {}", port.number), Ok(()));
    }

    let timeout = Duration::from_secs(config.service.activation_timeout_secs);
    let mut active = Vec::with_capacity(installed.len());
    for name in &installed {
        let unit = name.unit();
        log.record(
            format!("enable {unit}"),
            run_systemctl(host, &["enable", &unit], false).map(|_| ()),
        );
        log.record(
            format!("restart {unit}"),
            run_systemctl(host, &["restart", &unit], false).map(|_| ()),
        );
        let is_active = wait_active(host, &unit, timeout);
        if !is_active {
            tracing::warn!(unit = %unit, "unit did not become active; see `kiroctl service --logs`");
        }
        active.push((name.clone(), is_active));
    }

    Ok(InstallReport {
        identity,
        environment,
        units,
        firewall,
        steps: log.steps,
        active,
    })
}

/// Stop, disable and remove both services, then close the firewall ports.
///
/// With nothing installed this succeeds and removes nothing.
pub fn uninstall(host: &dyn Host, config: &StackConfig) -> Result<UninstallReport, DaemonError> {
    if !host.is_elevated() {
        return Err(DaemonError::NotElevated);
    }
    let mut log = StepLog::default();
    let mut removed = Vec::new();

    for name in config.service_names() {
        let state = probe_loaded(host, config, name);
        let unit = name.unit();
        if state.active {
            log.record(
                format!("stop {unit}"),
                run_systemctl(host, &["stop", &unit], false).map(|_| ()),
            );
        }
        if state.enabled {
            log.record(
                format!("disable {unit}"),
                run_systemctl(host, &["disable", &unit], false).map(|_| ()),
            );
        }
        match remove_unit(&state.descriptor) {
            Ok(true) => {
                log.record(format!("remove {}", state.descriptor.display()), Ok(()));
                removed.push(state.descriptor);
            }
            Ok(false) => {}
            Err(err) => log.record(
                format!("remove {}", state.descriptor.display()),
                Err(err.to_string()),
            ),
        }
    }

    log.record(
        "daemon-reload",
        run_systemctl(host, &["daemon-reload"], false).map(|_| ()),
    );
    let firewall = close_ports(host, config, &config.daemon_ports());

    Ok(UninstallReport {
        removed,
        firewall,
        steps: log.steps,
    })
}

/// Read-only status of both services.
pub fn status(host: &dyn Host, config: &StackConfig) -> Vec<ServiceStatus> {
    let ports = [config.backend_port(RunMode::Daemon), config.frontend_port()];
    config
        .service_names()
        .into_iter()
        .zip(Component::all())
        .zip(ports)
        .map(|((name, component), port)| {
            let state = probe(host, config, name);
            let detail = state.descriptor_present.then(|| {
                let unit = name.unit();
                match host.run("systemctl", &["status", &unit, "--no-pager"]) {
                    Ok(output) => output.combined(),
                    Err(err) => format!("systemctl status {unit}: {err}"),
                }
            });
            ServiceStatus {
                component: *component,
                state,
                port,
                detail,
            }
        })
        .collect()
}

/// Last `lines` journal lines per service.
pub fn logs(host: &dyn Host, config: &StackConfig, lines: usize) -> Vec<(ServiceName, String)> {
    let count = lines.to_string();
    config
        .service_names()
        .into_iter()
        .map(|name| {
            let unit = name.unit();
            let text = match host.run(
                "journalctl",
                &["-u", &unit, "-n", &count, "--no-pager"],
            ) {
                Ok(output) if output.success() => output.stdout,
                Ok(output) => output.combined(),
                Err(err) => format!("journalctl: {err}"),
            };
            (name.clone(), text)
        })
        .collect()
}

/// The `npm` a daemon install would use, without building anything.
fn planned_frontend(host: &dyn Host, config: &StackConfig) -> Result<PathBuf, String> {
    if !config.frontend.enabled {
        return Err("frontend disabled".to_string());
    }
    match detect_frontend(config) {
        Ok(Some(project)) if project.has_build_script => {}
        Ok(Some(_)) => return Err("package.json has no `build` script".to_string()),
        Ok(None) => {
            return Err(format!(
                "no frontend project at {}",
                config.frontend_dir().display()
            ))
        }
        Err(err) => return Err(err.to_string()),
    }
    detect_toolchain(host, config)
        .map(|toolchain| toolchain.npm)
        .ok_or_else(|| format!("{} not found on PATH", config.frontend.npm))
}

/// Render the descriptors `install` would write and diff them against disk.
/// Touches nothing.
pub fn plan(host: &dyn Host, config: &StackConfig) -> Result<Plan, DaemonError> {
    let identity = resolve_identity(host)?;
    let (npm, frontend_skipped) = match planned_frontend(host, config) {
        Ok(npm) => (Some(npm), None),
        Err(reason) => (None, Some(reason)),
    };

    let rendered = desired_units(config, &identity, npm.as_deref())?;
    let mut diffs = Vec::new();
    let mut unchanged = Vec::new();
    for unit in rendered {
        match unit_diff(&unit.path, &unit.content)? {
            Some(diff) => diffs.push(diff),
            None => unchanged.push(unit.path),
        }
    }

    Ok(Plan {
        identity,
        diffs,
        unchanged,
        frontend_skipped,
    })
}
