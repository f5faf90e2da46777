//! Builds the two [`Service`] values of the stack from a [`StackConfig`].

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::StackConfig;
use crate::types::{Component, RestartPolicy, RunMode, Service};

fn restart_for(config: &StackConfig, mode: RunMode) -> RestartPolicy {
    match mode {
        RunMode::Foreground => RestartPolicy::Never,
        RunMode::Daemon => RestartPolicy::OnFailure {
            delay_sec: config.service.restart_sec,
            interval_sec: config.service.start_limit_interval_sec,
            burst: config.service.start_limit_burst,
        },
    }
}

/// The backend API process: `<venv>/bin/python <entry> [args...]`.
///
/// In daemon mode `args` is ignored and the daemon port is baked in.
pub fn backend_service(config: &StackConfig, mode: RunMode, args: &[String]) -> Service {
    let port = config.backend_port(mode);
    let mut command = vec![
        config.venv_python().display().to_string(),
        config.backend.entry.clone(),
    ];
    match mode {
        RunMode::Foreground => command.extend(args.iter().cloned()),
        RunMode::Daemon => {
            command.push("--port".to_string());
            command.push(port.number.to_string());
        }
    }

    let mut env = BTreeMap::new();
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

    Service {
        name: config.service.backend_unit.clone(),
        component: Component::Backend,
        description: "Kiro gateway API backend".to_string(),
        command,
        working_dir: config.project_dir.clone(),
        env,
        env_file: Some(config.env_file()),
        restart: restart_for(config, mode),
        mode,
        port,
        after: vec![],
    }
}

/// The frontend: `npm run dev` in the foreground, `npm run preview` over the
/// static build in daemon mode. `npm` should be absolute in daemon mode.
pub fn frontend_service(config: &StackConfig, mode: RunMode, npm: &Path) -> Service {
    let port = config.frontend_port();
    let script = match mode {
        RunMode::Foreground => "dev",
        RunMode::Daemon => "preview",
    };
    let command = vec![
        npm.display().to_string(),
        "run".to_string(),
        script.to_string(),
        "--".to_string(),
        "--host".to_string(),
        config.frontend.host.clone(),
        "--port".to_string(),
        port.number.to_string(),
    ];

    let mut env = BTreeMap::new();
    if mode == RunMode::Daemon {
        env.insert("NODE_ENV".to_string(), "production".to_string());
    }

    Service {
        name: config.service.frontend_unit.clone(),
        component: Component::Frontend,
        description: "Kiro gateway admin dashboard".to_string(),
        command,
        working_dir: config.frontend_dir(),
        env,
        env_file: None,
        restart: restart_for(config, mode),
        mode,
        port,
        after: vec![config.service.backend_unit.unit()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> StackConfig {
        StackConfig {
            project_dir: PathBuf::from("/srv/kiro"),
            ..StackConfig::default()
        }
    }

    #[test]
    fn daemon_backend_bakes_in_daemon_port() {
        let svc = backend_service(&config(), RunMode::Daemon, &["--reload".to_string()]);
        assert_eq!(
            svc.command,
            vec!["/srv/kiro/venv/bin/python", "main.py", "--port", "9000"]
        );
        assert_eq!(svc.restart.systemd_value(), "on-failure");
        assert_eq!(svc.env_file, Some(PathBuf::from("/srv/kiro/.env")));
    }

    #[test]
    fn foreground_backend_forwards_args() {
        let args = vec!["--port".to_string(), "8100".to_string(), "--reload".to_string()];
        let svc = backend_service(&config(), RunMode::Foreground, &args);
        assert_eq!(&svc.command[2..], args.as_slice());
        assert_eq!(svc.restart, RestartPolicy::Never);
    }

    #[test]
    fn daemon_frontend_previews_build_after_backend() {
        let svc = frontend_service(&config(), RunMode::Daemon, Path::new("/usr/bin/npm"));
        assert_eq!(
            svc.exec_line(),
            "/usr/bin/npm run preview -- --host 0.0.0.0 --port 8991"
        );
        assert_eq!(svc.working_dir, PathBuf::from("/srv/kiro/frontend"));
        assert_eq!(svc.after, vec!["kiro-gateway.service"]);
    }

    #[test]
    fn foreground_frontend_runs_dev_server() {
        let svc = frontend_service(&config(), RunMode::Foreground, Path::new("npm"));
        assert_eq!(svc.command[2], "dev");
        assert!(svc.env.is_empty());
    }
}
