//! Firewall reconciliation through whichever front-end is active.
//!
//! Detection happens once per call ([`kiroctl_detector::detect_firewall`]),
//! then a single [`FirewallBackend`] handles every port. Rules are only ever
//! added when absent and removed when present, so repeated installs never
//! stack duplicate rules. No active firewall is a warning, not an error.

use std::path::PathBuf;

use kiroctl_core::{Host, HostCommand, Port, StackConfig};
use kiroctl_detector::{detect_firewall, FirewallKind};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one port's rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Added,
    AlreadyOpen,
    Removed,
    AlreadyClosed,
    Failed(String),
}

impl RuleOutcome {
    /// The firewall state changed and needs a reload / persist.
    pub fn changed(&self) -> bool {
        matches!(self, RuleOutcome::Added | RuleOutcome::Removed)
    }
}

/// Result of [`open_ports`] / [`close_ports`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallReport {
    /// `None` when no firewall is active; `rules` is then empty.
    pub backend: Option<FirewallKind>,
    pub rules: Vec<(Port, RuleOutcome)>,
    /// Reload / persist error, if the commit step failed.
    pub commit_error: Option<String>,
}

impl FirewallReport {
    fn skipped() -> Self {
        Self {
            backend: None,
            rules: Vec::new(),
            commit_error: None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Port, &str)> {
        self.rules.iter().filter_map(|(port, outcome)| match outcome {
            RuleOutcome::Failed(reason) => Some((port, reason.as_str())),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// FirewallBackend
// ---------------------------------------------------------------------------

/// One firewall front-end.
pub trait FirewallBackend {
    fn kind(&self) -> FirewallKind;

    /// Allow inbound TCP on `port`.
    fn open(&self, host: &dyn Host, port: &Port) -> RuleOutcome;

    /// Remove the allow rule for `port`.
    fn close(&self, host: &dyn Host, port: &Port) -> RuleOutcome;

    /// Make changes live and durable. Called only after a rule changed.
    fn commit(&self, host: &dyn Host) -> Result<(), String>;
}

/// Backend for a detected [`FirewallKind`].
pub fn backend_for(kind: FirewallKind, config: &StackConfig) -> Box<dyn FirewallBackend> {
    match kind {
        FirewallKind::Firewalld => Box::new(Firewalld),
        FirewallKind::Ufw => Box::new(Ufw),
        FirewallKind::Iptables => Box::new(Iptables {
            persist_paths: config.firewall.persist_paths.clone(),
        }),
    }
}

fn run_rule(host: &dyn Host, program: &str, args: &[&str]) -> Result<(bool, String), String> {
    host.run(program, args)
        .map(|out| (out.success(), out.combined()))
        .map_err(|e| format!("{program}: {e}"))
}

// ---- firewalld -------------------------------------------------------------

pub struct Firewalld;

impl FirewallBackend for Firewalld {
    fn kind(&self) -> FirewallKind {
        FirewallKind::Firewalld
    }

    fn open(&self, host: &dyn Host, port: &Port) -> RuleOutcome {
        let arg = format!("--add-port={}/tcp", port.number);
        match run_rule(host, "firewall-cmd", &["--permanent", arg.as_str()]) {
            Ok((_, text)) if text.contains("ALREADY_ENABLED") => RuleOutcome::AlreadyOpen,
            Ok((true, _)) => RuleOutcome::Added,
            Ok((false, text)) => RuleOutcome::Failed(text),
            Err(e) => RuleOutcome::Failed(e),
        }
    }

    fn close(&self, host: &dyn Host, port: &Port) -> RuleOutcome {
        let arg = format!("--remove-port={}/tcp", port.number);
        match run_rule(host, "firewall-cmd", &["--permanent", arg.as_str()]) {
            Ok((_, text)) if text.contains("NOT_ENABLED") => RuleOutcome::AlreadyClosed,
            Ok((true, _)) => RuleOutcome::Removed,
            Ok((false, text)) => RuleOutcome::Failed(text),
            Err(e) => RuleOutcome::Failed(e),
        }
    }

    fn commit(&self, host: &dyn Host) -> Result<(), String> {
        match run_rule(host, "firewall-cmd", &["--reload"])? {
            (true, _) => Ok(()),
            (false, text) => Err(text),
        }
    }
}

// ---- ufw -------------------------------------------------------------------

pub struct Ufw;

impl FirewallBackend for Ufw {
    fn kind(&self) -> FirewallKind {
        FirewallKind::Ufw
    }

    fn open(&self, host: &dyn Host, port: &Port) -> RuleOutcome {
        let rule = format!("{}/tcp", port.number);
        match run_rule(host, "ufw", &["allow", rule.as_str()]) {
            Ok((_, text)) if text.contains("Skipping") => RuleOutcome::AlreadyOpen,
            Ok((true, _)) => RuleOutcome::Added,
            Ok((false, text)) => RuleOutcome::Failed(text),
            Err(e) => RuleOutcome::Failed(e),
        }
    }

    fn close(&self, host: &dyn Host, port: &Port) -> RuleOutcome {
        let rule = format!("{}/tcp", port.number);
        match run_rule(host, "ufw", &["delete", "allow", rule.as_str()]) {
            Ok((_, text)) if text.contains("Could not delete non-existent rule") => {
                RuleOutcome::AlreadyClosed
            }
            Ok((true, _)) => RuleOutcome::Removed,
            Ok((false, text)) => RuleOutcome::Failed(text),
            Err(e) => RuleOutcome::Failed(e),
        }
    }

    // ufw applies and persists rules itself.
    fn commit(&self, _host: &dyn Host) -> Result<(), String> {
        Ok(())
    }
}

// ---- iptables --------------------------------------------------------------

/// Upper bound on duplicate rules removed for one port.
const MAX_DUPLICATE_RULES: usize = 16;

pub struct Iptables {
    /// `iptables-save` targets; the first one that exists is written.
    pub persist_paths: Vec<PathBuf>,
}

impl Iptables {
    fn rule(action: &str, port: &Port) -> Vec<String> {
        vec![
            action.to_string(),
            "INPUT".to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.number.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }

    fn run(host: &dyn Host, args: Vec<String>) -> Result<(bool, String), String> {
        host.exec(&HostCommand::new("iptables").args(args))
            .map(|out| (out.success(), out.combined()))
            .map_err(|e| format!("iptables: {e}"))
    }

    fn present(host: &dyn Host, port: &Port) -> Result<bool, String> {
        Self::run(host, Self::rule("-C", port)).map(|(ok, _)| ok)
    }
}

impl FirewallBackend for Iptables {
    fn kind(&self) -> FirewallKind {
        FirewallKind::Iptables
    }

    fn open(&self, host: &dyn Host, port: &Port) -> RuleOutcome {
        match Self::present(host, port) {
            Ok(true) => return RuleOutcome::AlreadyOpen,
            Ok(false) => {}
            Err(e) => return RuleOutcome::Failed(e),
        }
        match Self::run(host, Self::rule("-I", port)) {
            Ok((true, _)) => RuleOutcome::Added,
            Ok((false, text)) => RuleOutcome::Failed(text),
            Err(e) => RuleOutcome::Failed(e),
        }
    }

    fn close(&self, host: &dyn Host, port: &Port) -> RuleOutcome {
        let mut removed = 0;
        while removed < MAX_DUPLICATE_RULES {
            match Self::present(host, port) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return RuleOutcome::Failed(e),
            }
            match Self::run(host, Self::rule("-D", port)) {
                Ok((true, _)) => removed += 1,
                Ok((false, text)) => return RuleOutcome::Failed(text),
                Err(e) => return RuleOutcome::Failed(e),
            }
        }
        if removed == 0 {
            RuleOutcome::AlreadyClosed
        } else {
            RuleOutcome::Removed
        }
    }

    fn commit(&self, host: &dyn Host) -> Result<(), String> {
        let Some(target) = self.persist_paths.iter().find(|p| p.exists()) else {
            tracing::debug!("no iptables rules file; rules are live but not persisted");
            return Ok(());
        };
        let output = host
            .run("iptables-save", &[])
            .map_err(|e| format!("iptables-save: {e}"))?;
        if !output.success() {
            return Err(output.combined());
        }
        std::fs::write(target, output.stdout)
            .map_err(|e| format!("writing {}: {e}", target.display()))?;
        tracing::info!(path = %target.display(), "persisted iptables rules");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

fn apply<F>(host: &dyn Host, config: &StackConfig, ports: &[Port], verb: &str, f: F) -> FirewallReport
where
    F: Fn(&dyn FirewallBackend, &dyn Host, &Port) -> RuleOutcome,
{
    let Some(kind) = detect_firewall(host) else {
        tracing::warn!("no active firewall detected; skipping port {}", verb);
        return FirewallReport::skipped();
    };
    let backend = backend_for(kind, config);

    let mut rules = Vec::with_capacity(ports.len());
    for port in ports {
        let outcome = f(backend.as_ref(), host, port);
        match &outcome {
            RuleOutcome::Failed(reason) => {
                tracing::warn!(firewall = %kind, port = port.number, reason = %reason, "firewall {} failed", verb);
            }
            other => {
                tracing::info!(firewall = %kind, port = port.number, outcome = ?other, "firewall {}", verb);
            }
        }
        rules.push((port.clone(), outcome));
    }

    let mut commit_error = None;
    if rules.iter().any(|(_, outcome)| outcome.changed()) {
        if let Err(reason) = backend.commit(host) {
            tracing::warn!(firewall = %kind, reason = %reason, "firewall commit failed");
            commit_error = Some(reason);
        }
    }

    FirewallReport {
        backend: Some(kind),
        rules,
        commit_error,
    }
}

/// Allow inbound TCP on every port through the active firewall.
pub fn open_ports(host: &dyn Host, config: &StackConfig, ports: &[Port]) -> FirewallReport {
    apply(host, config, ports, "open", |backend, host, port| {
        backend.open(host, port)
    })
}

/// Remove the allow rules for every port. Rules that do not exist are fine.
pub fn close_ports(host: &dyn Host, config: &StackConfig, ports: &[Port]) -> FirewallReport {
    apply(host, config, ports, "close", |backend, host, port| {
        backend.close(host, port)
    })
}
