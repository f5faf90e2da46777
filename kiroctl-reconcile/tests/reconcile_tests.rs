//! Reclaimer, environment and firewall behaviour against a scripted host.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiroctl_core::fake::FakeHost;
use kiroctl_core::{CommandOutput, Port, RunMode, StackConfig};
use kiroctl_detector::FirewallKind;
use kiroctl_reconcile::{
    close_ports, ensure_environment, kill_matching, open_ports, reclaim, AssumeYes,
    ConfigFileState, Confirm, DependencyState, FrontendState, ReclaimResult, ReconcileError,
    RuleOutcome, VenvState,
};
use nix::sys::signal::Signal;
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Port reclaimer
// ---------------------------------------------------------------------------

fn lsof_reporting(stdout: &'static str) -> FakeHost {
    FakeHost::new()
        .with_own_pid(999)
        .respond("lsof", move |_| CommandOutput::ok(stdout))
}

#[test]
fn held_port_is_killed_and_grace_observed() {
    let host = lsof_reporting("4242\n4243\n");
    let port = Port::new(8000, "backend");
    let started = Instant::now();

    let result = reclaim(&host, &port, Duration::from_millis(50));

    assert_eq!(result, ReclaimResult::Reclaimed(2));
    assert_eq!(
        host.signals(),
        vec![(4242, Signal::SIGKILL), (4243, Signal::SIGKILL)]
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn free_port_is_a_noop() {
    let host = FakeHost::new().respond("lsof", |_| CommandOutput::failed(1, ""));
    let result = reclaim(&host, &Port::new(8991, "frontend-ui"), Duration::from_secs(5));
    assert_eq!(result, ReclaimResult::NoneHeld);
    assert!(host.signals().is_empty());
}

#[test]
fn vanished_holder_is_swallowed() {
    let host = lsof_reporting("4242\n");
    host.mark_dead(4242);
    let result = reclaim(&host, &Port::new(8000, "backend"), Duration::ZERO);
    assert_eq!(result, ReclaimResult::NoneHeld);
}

#[test]
fn own_pid_is_never_signalled() {
    let host = lsof_reporting("999\n4242\n");
    let result = reclaim(&host, &Port::new(8000, "backend"), Duration::ZERO);
    assert_eq!(result, ReclaimResult::Reclaimed(1));
    assert_eq!(host.signals(), vec![(4242, Signal::SIGKILL)]);
}

#[rstest]
#[case::not_installed(FakeHost::new())]
#[case::tool_error(FakeHost::new().respond("lsof", |_| CommandOutput::failed(2, "lsof: bad option")))]
fn introspection_failure_is_a_noop(#[case] host: FakeHost) {
    let result = reclaim(&host, &Port::new(8000, "backend"), Duration::from_secs(5));
    assert_eq!(result, ReclaimResult::NoneHeld);
    assert!(host.signals().is_empty());
}

#[test]
fn kill_matching_reports_a_match() {
    let host = FakeHost::new().respond("pkill", |_| CommandOutput::ok(""));
    assert!(kill_matching(&host, "main.py", "backend"));
}

// ---------------------------------------------------------------------------
// Environment reconciler
// ---------------------------------------------------------------------------

struct Project {
    dir: TempDir,
    config: StackConfig,
}

impl Project {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = StackConfig {
            project_dir: dir.path().to_path_buf(),
            ..StackConfig::default()
        };
        Self { dir, config }
    }

    fn with_template(self) -> Self {
        fs::write(self.dir.path().join(".env.example"), "API_KEY=\n").expect("write");
        self
    }

    fn with_env(self) -> Self {
        fs::write(self.dir.path().join(".env"), "API_KEY=x\n").expect("write");
        self
    }

    fn with_venv(self) -> Self {
        let bin = self.dir.path().join("venv").join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        fs::write(bin.join("python"), "").expect("write");
        self
    }

    fn with_frontend(self, package_json: &str, installed: bool) -> Self {
        let frontend = self.dir.path().join("frontend");
        fs::create_dir_all(&frontend).expect("mkdir");
        fs::write(frontend.join("package.json"), package_json).expect("write");
        if installed {
            fs::create_dir_all(frontend.join("node_modules")).expect("mkdir");
        }
        self
    }

    fn python(&self) -> String {
        self.config.venv_python().display().to_string()
    }

    fn pip(&self) -> String {
        self.config.venv_pip().display().to_string()
    }

    /// Python 3.11 on PATH, imports resolve inside the venv.
    fn healthy_host(&self) -> FakeHost {
        let host = FakeHost::new()
            .with_program("python3", "/usr/bin/python3")
            .respond("python3", |args| {
                if args.first().map(String::as_str) == Some("--version") {
                    CommandOutput::ok("Python 3.11.4\n")
                } else {
                    CommandOutput::ok("")
                }
            });
        host.on(&self.python(), |_| CommandOutput::ok(""));
        host
    }
}

/// Records the prompt and how many host commands ran before it.
struct RecordingPrompt<'a> {
    host: &'a FakeHost,
    answer: bool,
    asked: RefCell<Vec<(String, Vec<String>)>>,
}

impl<'a> RecordingPrompt<'a> {
    fn new(host: &'a FakeHost, answer: bool) -> Self {
        Self {
            host,
            answer,
            asked: RefCell::new(Vec::new()),
        }
    }
}

impl Confirm for RecordingPrompt<'_> {
    fn confirm(&self, message: &str) -> bool {
        self.asked
            .borrow_mut()
            .push((message.to_string(), self.host.command_lines()));
        self.answer
    }
}

#[test]
fn seeded_config_is_acknowledged_before_any_spawn() {
    let project = Project::new().with_template().with_venv();
    let host = project.healthy_host();
    let prompt = RecordingPrompt::new(&host, true);

    let report = ensure_environment(&host, &project.config, RunMode::Foreground, &prompt)
        .expect("environment");

    assert_eq!(report.config_file, ConfigFileState::Seeded);
    assert_eq!(
        fs::read_to_string(project.dir.path().join(".env")).expect("read"),
        "API_KEY=\n"
    );
    let asked = prompt.asked.borrow();
    assert_eq!(asked.len(), 1);
    assert!(asked[0].0.contains(".env"));
    assert_eq!(asked[0].1, vec!["python3 --version"], "only the runtime probe may precede the prompt");
}

#[test]
fn declining_the_prompt_aborts() {
    let project = Project::new().with_template();
    let host = project.healthy_host();
    let prompt = RecordingPrompt::new(&host, false);

    let err = ensure_environment(&host, &project.config, RunMode::Foreground, &prompt)
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Declined { .. }), "got: {err}");
    assert_eq!(host.command_lines(), vec!["python3 --version"]);
}

#[test]
fn missing_template_is_fatal_in_foreground() {
    let project = Project::new().with_venv();
    let host = project.healthy_host();
    let err = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .unwrap_err();
    assert!(matches!(err, ReconcileError::TemplateMissing { .. }), "got: {err}");
}

#[test]
fn missing_template_is_tolerated_in_daemon_mode() {
    let mut project = Project::new().with_venv();
    project.config.frontend.enabled = false;
    let host = project.healthy_host();
    let prompt = RecordingPrompt::new(&host, false);

    let report = ensure_environment(&host, &project.config, RunMode::Daemon, &prompt)
        .expect("environment");
    assert_eq!(report.config_file, ConfigFileState::Absent);
    assert!(prompt.asked.borrow().is_empty());
}

#[test]
fn too_old_runtime_stops_before_anything_else() {
    let project = Project::new().with_template();
    let host = FakeHost::new().respond("python3", |_| CommandOutput::ok("Python 3.9.2"));
    let err = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .unwrap_err();
    assert!(err.to_string().contains("install Python >= 3.10"), "got: {err}");
    assert!(!project.dir.path().join(".env").exists());
}

#[test]
fn missing_venv_is_created_and_existing_reused() {
    let project = Project::new().with_env();
    let host = project.healthy_host();
    let report = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .expect("environment");
    assert_eq!(report.venv, VenvState::Created);
    let venv = project.config.venv_dir().display().to_string();
    assert!(host
        .calls_to("python3")
        .contains(&vec!["-m".to_string(), "venv".to_string(), venv]));

    let project = Project::new().with_env().with_venv();
    let host = project.healthy_host();
    let report = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .expect("environment");
    assert_eq!(report.venv, VenvState::Reused);
    assert_eq!(host.calls_to("python3").len(), 1);
}

#[test]
fn failing_import_installs_whole_manifest() {
    let project = Project::new().with_env().with_venv();
    let host = FakeHost::new().respond("python3", |_| CommandOutput::ok("Python 3.12.1"));
    host.on(&project.python(), |_| {
        CommandOutput::failed(1, "ModuleNotFoundError: No module named 'loguru'")
    });
    host.on(&project.pip(), |_| CommandOutput::ok(""));

    let report = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .expect("environment");
    assert_eq!(report.dependencies, DependencyState::Installed);
    let requirements = project.config.requirements().display().to_string();
    assert_eq!(
        host.calls_to(&project.pip()),
        vec![vec!["install".to_string(), "-r".to_string(), requirements]]
    );
}

#[test]
fn pip_failure_is_fatal() {
    let project = Project::new().with_env().with_venv();
    let host = FakeHost::new().respond("python3", |_| CommandOutput::ok("Python 3.12.1"));
    host.on(&project.python(), |_| CommandOutput::failed(1, "no module"));
    host.on(&project.pip(), |_| CommandOutput::failed(1, ""));
    let err = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .unwrap_err();
    assert!(matches!(err, ReconcileError::DependencyInstall { .. }), "got: {err}");
}

#[test]
fn daemon_mode_installs_and_builds_frontend() {
    let project = Project::new()
        .with_env()
        .with_venv()
        .with_frontend(r#"{"scripts":{"dev":"vite","build":"vite build"}}"#, false);
    let host = project
        .healthy_host()
        .with_program("npm", "/usr/bin/npm")
        .respond("/usr/bin/npm", |_| CommandOutput::ok("10.1.0"));

    let report = ensure_environment(&host, &project.config, RunMode::Daemon, &AssumeYes)
        .expect("environment");
    assert_eq!(
        report.frontend,
        FrontendState::Ready {
            npm: "/usr/bin/npm".into(),
            installed: true,
            built: true,
        }
    );
    let frontend_dir = project.config.frontend_dir();
    let npm_calls: Vec<_> = host
        .calls()
        .into_iter()
        .filter(|c| c.program == "/usr/bin/npm")
        .collect();
    assert_eq!(npm_calls.len(), 3, "--version, install, run build");
    assert_eq!(npm_calls[1].args, vec!["install"]);
    assert_eq!(npm_calls[2].args, vec!["run", "build"]);
    assert!(npm_calls[1..].iter().all(|c| c.cwd.as_ref() == Some(&frontend_dir)));
}

#[test]
fn foreground_skips_install_when_node_modules_present() {
    let project = Project::new()
        .with_env()
        .with_venv()
        .with_frontend(r#"{"scripts":{"dev":"vite"}}"#, true);
    let host = project
        .healthy_host()
        .with_program("npm", "/usr/bin/npm")
        .respond("/usr/bin/npm", |_| CommandOutput::ok("10.1.0"));

    let report = ensure_environment(&host, &project.config, RunMode::Foreground, &AssumeYes)
        .expect("environment");
    assert_eq!(report.frontend_npm(), Some(std::path::Path::new("/usr/bin/npm")));
    assert_eq!(host.calls_to("/usr/bin/npm"), vec![vec!["--version"]]);
}

#[rstest]
#[case::no_npm(None)]
#[case::build_fails(Some(2))]
fn frontend_problems_degrade_to_backend_only(#[case] build_code: Option<i32>) {
    let project = Project::new()
        .with_env()
        .with_venv()
        .with_frontend(r#"{"scripts":{"build":"vite build"}}"#, true);
    let mut host = project.healthy_host();
    if let Some(code) = build_code {
        host = host
            .with_program("npm", "/usr/bin/npm")
            .respond("/usr/bin/npm", move |args| {
                if args.first().map(String::as_str) == Some("run") {
                    CommandOutput::failed(code, "")
                } else {
                    CommandOutput::ok("10.1.0")
                }
            });
    }

    let report = ensure_environment(&host, &project.config, RunMode::Daemon, &AssumeYes)
        .expect("degradation is not an error");
    assert!(matches!(report.frontend, FrontendState::Unavailable(_)));
    assert!(report.frontend_npm().is_none());
}

// ---------------------------------------------------------------------------
// Firewall reconciler
// ---------------------------------------------------------------------------

/// iptables with a real rule table behind `-C/-I/-D`.
fn stateful_iptables(rules: Arc<Mutex<BTreeMap<String, usize>>>) -> FakeHost {
    FakeHost::new()
        .with_program("iptables", "/usr/sbin/iptables")
        .respond("systemctl", |_| CommandOutput::failed(3, "inactive"))
        .respond("iptables", move |args| {
            let mut rules = rules.lock().unwrap();
            let key = args.get(5).cloned().unwrap_or_default();
            match args.first().map(String::as_str) {
                Some("-S") => CommandOutput::ok("-P INPUT ACCEPT\n"),
                Some("-C") if rules.get(&key).copied().unwrap_or(0) > 0 => CommandOutput::ok(""),
                Some("-C") => CommandOutput::failed(1, "Bad rule"),
                Some("-I") => {
                    *rules.entry(key).or_insert(0) += 1;
                    CommandOutput::ok("")
                }
                Some("-D") => {
                    if let Some(n) = rules.get_mut(&key) {
                        *n -= 1;
                    }
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed(2, "unexpected"),
            }
        })
}

fn daemon_ports() -> Vec<Port> {
    StackConfig::default().daemon_ports()
}

#[test]
fn opening_twice_adds_each_rule_once() {
    let rules = Arc::new(Mutex::new(BTreeMap::new()));
    let host = stateful_iptables(Arc::clone(&rules));
    let mut config = StackConfig::default();
    config.firewall.persist_paths.clear();

    let first = open_ports(&host, &config, &daemon_ports());
    let second = open_ports(&host, &config, &daemon_ports());

    assert_eq!(first.backend, Some(FirewallKind::Iptables));
    assert!(first.rules.iter().all(|(_, o)| *o == RuleOutcome::Added));
    assert!(second.rules.iter().all(|(_, o)| *o == RuleOutcome::AlreadyOpen));
    let rules = rules.lock().unwrap();
    assert_eq!(rules.get("9000"), Some(&1));
    assert_eq!(rules.get("8991"), Some(&1));
}

#[test]
fn iptables_changes_are_persisted_to_existing_rules_file() {
    let dir = TempDir::new().expect("tempdir");
    let rules_file = dir.path().join("rules.v4");
    fs::write(&rules_file, "").expect("write");

    let host = stateful_iptables(Arc::new(Mutex::new(BTreeMap::new())))
        .respond("iptables-save", |_| CommandOutput::ok("*filter\nCOMMIT\n"));
    let mut config = StackConfig::default();
    config.firewall.persist_paths = vec![dir.path().join("missing"), rules_file.clone()];

    let report = open_ports(&host, &config, &daemon_ports());
    assert_eq!(report.commit_error, None);
    assert_eq!(fs::read_to_string(&rules_file).expect("read"), "*filter\nCOMMIT\n");
}

#[test]
fn closing_removes_present_rules_and_tolerates_absent_ones() {
    let rules = Arc::new(Mutex::new(BTreeMap::from([("9000".to_string(), 2)])));
    let host = stateful_iptables(Arc::clone(&rules));
    let mut config = StackConfig::default();
    config.firewall.persist_paths.clear();

    let report = close_ports(&host, &config, &daemon_ports());
    assert_eq!(report.rules[0].1, RuleOutcome::Removed);
    assert_eq!(report.rules[1].1, RuleOutcome::AlreadyClosed);
    assert_eq!(rules.lock().unwrap().get("9000"), Some(&0));
}

#[test]
fn no_firewall_is_skipped_without_error() {
    let host = FakeHost::new();
    let report = open_ports(&host, &StackConfig::default(), &daemon_ports());
    assert_eq!(report.backend, None);
    assert!(report.rules.is_empty());
    assert_eq!(report.failures().count(), 0);
}

#[test]
fn ufw_is_used_when_firewalld_inactive() {
    let host = FakeHost::new()
        .with_program("firewall-cmd", "/usr/bin/firewall-cmd")
        .with_program("ufw", "/usr/sbin/ufw")
        .respond("systemctl", |_| CommandOutput::failed(3, "inactive"))
        .respond("ufw", |args| {
            if args.first().map(String::as_str) == Some("status") {
                CommandOutput::ok("Status: active\n")
            } else {
                CommandOutput::ok("Rule added\n")
            }
        });
    let report = open_ports(&host, &StackConfig::default(), &daemon_ports());
    assert_eq!(report.backend, Some(FirewallKind::Ufw));
    assert!(host.calls_to("firewall-cmd").is_empty());
    assert!(host
        .calls_to("ufw")
        .contains(&vec!["allow".to_string(), "9000/tcp".to_string()]));
}
