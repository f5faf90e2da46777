//! `kiroctl service`: systemd install, removal and inspection.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use kiroctl_core::{RunMode, StackConfig, SystemHost};
use kiroctl_daemon::systemd::{self, InstallReport, ServiceStatus, StepOutcome, UninstallReport};
use kiroctl_reconcile::{ConfigFileState, FirewallReport, FrontendState, RuleOutcome};

use crate::ui;
use crate::GlobalArgs;

const DEFAULT_LOG_LINES: &str = "50";

/// Without flags: install (or refresh) and start both services.
#[derive(Args, Debug)]
pub struct ServiceArgs {
    /// Stop, disable and remove the services.
    #[arg(long, conflicts_with_all = ["status", "logs", "dry_run"])]
    pub uninstall: bool,

    /// Show unit state and the backend health endpoint. Changes nothing.
    #[arg(long, conflicts_with_all = ["logs", "dry_run"])]
    pub status: bool,

    /// Print the last N journal lines of each service.
    #[arg(
        long,
        value_name = "N",
        num_args = 0..=1,
        default_missing_value = DEFAULT_LOG_LINES,
        conflicts_with = "dry_run"
    )]
    pub logs: Option<usize>,

    /// Show what install would write, as a diff. Changes nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// With --status: emit machine-readable JSON.
    #[arg(long, requires = "status")]
    pub json: bool,
}

impl ServiceArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.load()?;
        let host = SystemHost;

        if self.uninstall {
            return uninstall(&host, &config);
        }
        if self.status {
            let rows = systemd::status(&host, &config);
            if self.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).context("failed to serialize status JSON")?
                );
            } else {
                print_status(&config, &rows);
            }
            return Ok(());
        }
        if let Some(lines) = self.logs {
            for (name, text) in systemd::logs(&host, &config, lines) {
                println!("{}", format!("==> {} <==", name.unit()).bold());
                print!("{text}");
                if !text.ends_with('\n') {
                    println!();
                }
            }
            return Ok(());
        }
        if self.dry_run {
            return dry_run(&host, &config);
        }
        install(&host, &config)
    }
}

// ---------------------------------------------------------------------------
// install / uninstall
// ---------------------------------------------------------------------------

fn install(host: &SystemHost, config: &StackConfig) -> Result<()> {
    ui::step("Installing systemd services");
    let report = systemd::install(host, config).context("service installation failed")?;
    print_install(&report);

    if !report.succeeded() {
        let inactive = report.active.iter().filter(|(_, active)| !active).count();
        tracing::error!(failed = failed_steps(&report.steps), inactive, "installation incomplete");
        bail!(
            "installation incomplete: {} failed step(s), {inactive} inactive service(s); see `kiroctl service --logs`",
            failed_steps(&report.steps)
        );
    }
    ui::ok(&format!(
        "backend on port {}",
        config.backend_port(RunMode::Daemon).number
    ));
    if report.environment.frontend_npm().is_some() {
        ui::ok(&format!("web UI on port {}", config.frontend_port().number));
    }
    Ok(())
}

fn uninstall(host: &SystemHost, config: &StackConfig) -> Result<()> {
    ui::step("Removing systemd services");
    let report = systemd::uninstall(host, config).context("service removal failed")?;
    print_uninstall(&report);
    if !report.succeeded() {
        bail!(
            "removal finished with {} failed step(s)",
            failed_steps(&report.steps)
        );
    }
    Ok(())
}

fn failed_steps(steps: &[systemd::Step]) -> usize {
    steps
        .iter()
        .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
        .count()
}

fn print_steps(steps: &[systemd::Step]) {
    for step in steps {
        match &step.outcome {
            StepOutcome::Done => ui::ok(&step.name),
            StepOutcome::Skipped(reason) => ui::warn(&format!("{}: skipped ({reason})", step.name)),
            StepOutcome::Failed(reason) => ui::fail(&format!("{}: {reason}", step.name)),
        }
    }
}

fn print_firewall(report: &FirewallReport) {
    let Some(kind) = report.backend else {
        ui::warn("no active firewall detected; ports left as they are");
        return;
    };
    for (port, outcome) in &report.rules {
        let text = format!("{kind}: port {port}");
        match outcome {
            RuleOutcome::Added => ui::ok(&format!("{text} opened")),
            RuleOutcome::AlreadyOpen => ui::ok(&format!("{text} already open")),
            RuleOutcome::Removed => ui::ok(&format!("{text} closed")),
            RuleOutcome::AlreadyClosed => ui::ok(&format!("{text} already closed")),
            RuleOutcome::Failed(reason) => ui::fail(&format!("{text}: {reason}")),
        }
    }
    if let Some(reason) = &report.commit_error {
        ui::warn(&format!("{kind}: rules not persisted: {reason}"));
    }
}

fn print_install(report: &InstallReport) {
    let env = &report.environment;
    ui::ok(&format!(
        "runtime {} | venv {:?} | dependencies {:?}",
        env.runtime.version, env.venv, env.dependencies
    ));
    match env.config_file {
        ConfigFileState::Present => {}
        ConfigFileState::Seeded => ui::warn("created .env from .env.example; review it"),
        ConfigFileState::Absent => ui::warn("no .env; services start without it"),
    }
    match &env.frontend {
        FrontendState::Ready { built, .. } if *built => ui::ok("web UI built"),
        FrontendState::Ready { .. } => {}
        FrontendState::Disabled => ui::warn("web UI disabled"),
        FrontendState::Unavailable(reason) => {
            ui::warn(&format!("web UI skipped: {reason}"));
        }
    }
    ui::ok(&format!(
        "services run as {}:{}",
        report.identity.user, report.identity.group
    ));
    for unit in &report.units {
        let verb = if unit.written() { "wrote" } else { "unchanged" };
        ui::ok(&format!("{verb} {}", unit.path().display()));
    }
    print_steps(&report.steps);
    print_firewall(&report.firewall);
    for (name, active) in &report.active {
        if *active {
            ui::ok(&format!("{} is active", name.unit()));
        } else {
            ui::fail(&format!("{} did not become active", name.unit()));
        }
    }
}

fn print_uninstall(report: &UninstallReport) {
    print_steps(&report.steps);
    print_firewall(&report.firewall);
    if report.removed.is_empty() {
        ui::ok("nothing was installed");
    }
}

// ---------------------------------------------------------------------------
// dry run
// ---------------------------------------------------------------------------

fn dry_run(host: &SystemHost, config: &StackConfig) -> Result<()> {
    let plan = systemd::plan(host, config).context("failed to plan installation")?;
    if let Some(reason) = &plan.frontend_skipped {
        ui::warn(&format!("web UI unit not planned: {reason}"));
    }
    for path in &plan.unchanged {
        ui::ok(&format!("{} is up to date", path.display()));
    }
    for diff in &plan.diffs {
        print!("{}", diff.unified_diff);
        if !diff.unified_diff.ends_with('\n') {
            println!();
        }
    }
    if plan.diffs.is_empty() {
        println!("No differences.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "service")]
    service: String,
    #[tabled(rename = "port")]
    port: u16,
    #[tabled(rename = "descriptor")]
    descriptor: String,
    #[tabled(rename = "enabled")]
    enabled: String,
    #[tabled(rename = "active")]
    active: String,
}

fn yes_no(value: bool) -> String {
    if value {
        "yes".green().to_string()
    } else {
        "no".red().to_string()
    }
}

fn status_row(row: &ServiceStatus) -> StatusRow {
    let present = row.state.descriptor_present;
    StatusRow {
        service: row.state.name.unit(),
        port: row.port.number,
        descriptor: if present {
            row.state.descriptor.display().to_string()
        } else {
            "-".to_string()
        },
        enabled: if present { yes_no(row.state.enabled) } else { "-".to_string() },
        active: if present { yes_no(row.state.active) } else { "-".to_string() },
    }
}

/// Fields of the backend's unauthenticated `GET /api/admin/status`.
#[derive(Debug, Deserialize)]
struct AdminStatus {
    version: Option<String>,
    uptime_seconds: Option<f64>,
    region: Option<String>,
    token_valid: Option<bool>,
    models_loaded: Option<u64>,
}

fn probe_backend(port: u16) -> Result<AdminStatus> {
    let url = format!("http://127.0.0.1:{port}/api/admin/status");
    tracing::debug!(%url, "probing backend");
    ureq::get(&url)
        .timeout(Duration::from_secs(3))
        .call()
        .with_context(|| format!("GET {url}"))?
        .into_json::<AdminStatus>()
        .with_context(|| format!("unexpected response from {url}"))
}

fn format_uptime(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

fn print_status(config: &StackConfig, rows: &[ServiceStatus]) {
    println!("kiroctl v{} | {}", env!("CARGO_PKG_VERSION"), config.project_dir.display());
    let table_rows: Vec<StatusRow> = rows.iter().map(status_row).collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");

    for row in rows {
        let unit = row.state.name.unit();
        match &row.detail {
            None => println!("{unit}: no known service descriptor"),
            Some(detail) => {
                println!("{}", format!("==> {unit} <==").bold());
                print!("{detail}");
                if !detail.ends_with('\n') {
                    println!();
                }
            }
        }
    }

    let Some(backend) = rows.first().filter(|row| row.state.active) else {
        return;
    };
    match probe_backend(backend.port.number) {
        Ok(status) => {
            ui::ok(&format!(
                "backend healthy | version {} | up {} | region {} | token {} | models {}",
                status.version.as_deref().unwrap_or("?"),
                status.uptime_seconds.map(format_uptime).unwrap_or_else(|| "?".to_string()),
                status.region.as_deref().unwrap_or("?"),
                match status.token_valid {
                    Some(true) => "valid",
                    Some(false) => "invalid",
                    None => "?",
                },
                status.models_loaded.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string()),
            ));
        }
        Err(err) => {
            let error = format!("{err:#}");
            tracing::warn!(port = backend.port.number, %error, "backend health check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_humanised() {
        assert_eq!(format_uptime(42.7), "42s");
        assert_eq!(format_uptime(125.0), "2m 5s");
        assert_eq!(format_uptime(7260.0), "2h 1m");
    }

    #[test]
    fn admin_status_tolerates_extra_and_missing_fields() {
        let status: AdminStatus = serde_json::from_str(
            r#"{"version":"1.4.0","uptime_seconds":12.5,"auth_type":"social","proxy_enabled":false}"#,
        )
        .expect("json");
        assert_eq!(status.version.as_deref(), Some("1.4.0"));
        assert_eq!(status.uptime_seconds, Some(12.5));
        assert!(status.region.is_none());
    }
}
