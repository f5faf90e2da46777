//! Parameterised host detection tests for `kiroctl-detector`.
//!
//! Every case scripts its own `FakeHost`: no real tools are invoked.

use std::fs;

use kiroctl_core::fake::FakeHost;
use kiroctl_core::{CommandOutput, StackConfig, Version};
use kiroctl_detector::{
    detect_firewall, detect_frontend, detect_runtime, detect_toolchain, DetectError, FirewallKind,
};
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

fn python_reporting(banner: &'static str) -> FakeHost {
    FakeHost::new()
        .with_program("python3", "/usr/bin/python3")
        .respond("python3", move |_| CommandOutput::ok(banner))
}

fn config_at(dir: &TempDir) -> StackConfig {
    StackConfig {
        project_dir: dir.path().to_path_buf(),
        ..StackConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[rstest]
#[case("Python 3.10.0", Version::new(3, 10, 0))]
#[case("Python 3.11.4\n", Version::new(3, 11, 4))]
#[case("Python 3.13.0rc2", Version::new(3, 13, 0))]
fn runtime_meeting_minimum(#[case] banner: &'static str, #[case] expected: Version) {
    let host = python_reporting(banner);
    let info = detect_runtime(&host, &StackConfig::default()).expect("runtime");
    assert_eq!(info.version, expected);
    assert_eq!(info.path.as_deref(), Some(std::path::Path::new("/usr/bin/python3")));
}

#[rstest]
#[case("Python 3.9.18")]
#[case("Python 3.8.10")]
fn runtime_below_minimum_is_fatal(#[case] banner: &'static str) {
    let host = python_reporting(banner);
    let err = detect_runtime(&host, &StackConfig::default()).unwrap_err();
    assert!(matches!(err, DetectError::RuntimeTooOld { .. }), "got: {err}");
    assert!(
        err.to_string().contains("install Python >= 3.10.0"),
        "fatal message must name the fix, got: {err}"
    );
}

#[test]
fn runtime_missing_is_fatal_with_fix() {
    let host = FakeHost::new();
    let err = detect_runtime(&host, &StackConfig::default()).unwrap_err();
    assert!(matches!(err, DetectError::RuntimeMissing { .. }), "got: {err}");
    assert!(err.to_string().contains("install Python"));
}

#[test]
fn python2_banner_on_stderr_is_read() {
    let host = FakeHost::new().respond("python3", |_| CommandOutput {
        code: Some(0),
        stdout: String::new(),
        stderr: "Python 2.7.18".to_string(),
    });
    let err = detect_runtime(&host, &StackConfig::default()).unwrap_err();
    match err {
        DetectError::RuntimeTooOld { found, .. } => assert_eq!(found, Version::new(2, 7, 18)),
        other => panic!("expected RuntimeTooOld, got {other}"),
    }
}

#[test]
fn raised_minimum_from_config_applies() {
    let host = python_reporting("Python 3.11.2");
    let mut config = StackConfig::default();
    config.runtime.min_version = "3.12".to_string();
    assert!(matches!(
        detect_runtime(&host, &config),
        Err(DetectError::RuntimeTooOld { .. })
    ));
}

// ---------------------------------------------------------------------------
// Frontend
// ---------------------------------------------------------------------------

#[test]
fn toolchain_absent_is_none() {
    assert!(detect_toolchain(&FakeHost::new(), &StackConfig::default()).is_none());
}

#[test]
fn toolchain_present_resolves_absolute_npm() {
    let host = FakeHost::new()
        .with_program("npm", "/usr/local/bin/npm")
        .respond("/usr/local/bin/npm", |_| CommandOutput::ok("10.2.4\n"));
    let toolchain = detect_toolchain(&host, &StackConfig::default()).expect("npm");
    assert_eq!(toolchain.npm, std::path::PathBuf::from("/usr/local/bin/npm"));
    assert_eq!(toolchain.version, Some(Version::new(10, 2, 4)));
}

#[test]
fn frontend_missing_dir_is_none() {
    let dir = TempDir::new().expect("tempdir");
    assert!(detect_frontend(&config_at(&dir)).expect("detect").is_none());
}

#[test]
fn frontend_scripts_and_install_state() {
    let dir = TempDir::new().expect("tempdir");
    let frontend = dir.path().join("frontend");
    fs::create_dir_all(frontend.join("node_modules")).expect("mkdir");
    fs::write(
        frontend.join("package.json"),
        r#"{"name":"ui","scripts":{"dev":"vite","build":"vite build"}}"#,
    )
    .expect("write");

    let project = detect_frontend(&config_at(&dir)).expect("detect").expect("frontend");
    assert!(project.installed);
    assert!(project.has_dev_script);
    assert!(project.has_build_script);
    assert!(!project.has_preview_script);
}

#[test]
fn frontend_corrupt_manifest_is_parse_error() {
    let dir = TempDir::new().expect("tempdir");
    let frontend = dir.path().join("frontend");
    fs::create_dir_all(&frontend).expect("mkdir");
    fs::write(frontend.join("package.json"), "{ not json").expect("write");

    let err = detect_frontend(&config_at(&dir)).unwrap_err();
    assert!(matches!(err, DetectError::ParseError { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

fn host_with_firewalls(firewalld: bool, ufw: bool, iptables: bool) -> FakeHost {
    FakeHost::new()
        .with_program("firewall-cmd", "/usr/bin/firewall-cmd")
        .with_program("ufw", "/usr/sbin/ufw")
        .with_program("iptables", "/usr/sbin/iptables")
        .respond("systemctl", move |_| {
            CommandOutput::ok(if firewalld { "active\n" } else { "inactive\n" })
        })
        .respond("ufw", move |_| {
            CommandOutput::ok(if ufw {
                "Status: active\n"
            } else {
                "Status: inactive\n"
            })
        })
        .respond("iptables", move |_| {
            if iptables {
                CommandOutput::ok("-P INPUT ACCEPT\n")
            } else {
                CommandOutput::failed(4, "iptables: Permission denied")
            }
        })
}

#[rstest]
#[case(true, true, true, Some(FirewallKind::Firewalld))]
#[case(false, true, true, Some(FirewallKind::Ufw))]
#[case(false, false, true, Some(FirewallKind::Iptables))]
#[case(false, false, false, None)]
fn firewall_priority(
    #[case] firewalld: bool,
    #[case] ufw: bool,
    #[case] iptables: bool,
    #[case] expected: Option<FirewallKind>,
) {
    let host = host_with_firewalls(firewalld, ufw, iptables);
    assert_eq!(detect_firewall(&host), expected);
}

#[test]
fn firewalld_installed_but_not_running_is_skipped() {
    let host = FakeHost::new()
        .with_program("firewall-cmd", "/usr/bin/firewall-cmd")
        .respond("systemctl", |_| CommandOutput::failed(3, "inactive"));
    assert_eq!(detect_firewall(&host), None);
    assert!(host.calls_to("firewall-cmd").is_empty());
}

#[test]
fn nothing_installed_probes_nothing() {
    let host = FakeHost::new();
    assert_eq!(detect_firewall(&host), None);
    assert!(host.calls().is_empty());
}
