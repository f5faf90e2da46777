//! Template context: serializable rendering payload built from a [`Service`].

use serde::{Deserialize, Serialize};

use kiroctl_core::{RestartPolicy, Service, ServiceIdentity};

use crate::error::RenderError;

/// Nested rendering payload, one section per block of the unit file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitContext {
    pub unit: UnitCtx,
    pub identity: IdentityCtx,
    pub exec: ExecCtx,
    pub restart: RestartCtx,
    pub logging: LoggingCtx,
    pub meta: MetaCtx,
}

/// `[Unit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitCtx {
    pub name: String,
    pub description: String,
    pub after: Vec<String>,
    pub wants: Vec<String>,
}

/// Account the service runs as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCtx {
    pub user: String,
    pub group: String,
}

/// What to run and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecCtx {
    pub working_directory: String,
    pub exec_start: String,
    pub environment_file: Option<String>,
    pub environment: Vec<EnvVarCtx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVarCtx {
    pub key: String,
    pub value: String,
}

/// Restart policy and crash-loop rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartCtx {
    pub policy: String,
    /// Whether the start-rate limit applies (any policy other than `no`).
    pub limited: bool,
    pub restart_sec: u32,
    pub start_limit_interval_sec: u32,
    pub start_limit_burst: u32,
}

/// Journal routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingCtx {
    pub syslog_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCtx {
    pub version: String,
    pub port: u16,
}

const NETWORK_TARGET: &str = "network-online.target";

impl UnitContext {
    /// Build a [`UnitContext`] for `service` running as `identity`.
    pub fn from_service(service: &Service, identity: &ServiceIdentity) -> Self {
        let mut after = vec![NETWORK_TARGET.to_string()];
        after.extend(service.after.iter().cloned());
        let mut wants = vec![NETWORK_TARGET.to_string()];
        wants.extend(service.after.iter().cloned());

        let restart = match &service.restart {
            RestartPolicy::Never => RestartCtx {
                policy: service.restart.systemd_value().to_string(),
                limited: false,
                restart_sec: 0,
                start_limit_interval_sec: 0,
                start_limit_burst: 0,
            },
            RestartPolicy::OnFailure {
                delay_sec,
                interval_sec,
                burst,
            } => RestartCtx {
                policy: service.restart.systemd_value().to_string(),
                limited: true,
                restart_sec: *delay_sec,
                start_limit_interval_sec: *interval_sec,
                start_limit_burst: *burst,
            },
        };

        UnitContext {
            unit: UnitCtx {
                name: service.name.0.clone(),
                description: service.description.clone(),
                after,
                wants,
            },
            identity: IdentityCtx {
                user: identity.user.clone(),
                group: identity.group.clone(),
            },
            exec: ExecCtx {
                working_directory: service.working_dir.display().to_string(),
                exec_start: service.exec_line(),
                environment_file: service
                    .env_file
                    .as_ref()
                    .map(|path| path.display().to_string()),
                environment: service
                    .env
                    .iter()
                    .map(|(key, value)| EnvVarCtx {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            },
            restart,
            logging: LoggingCtx {
                syslog_identifier: service.name.0.clone(),
            },
            meta: MetaCtx {
                version: env!("CARGO_PKG_VERSION").to_string(),
                port: service.port.number,
            },
        }
    }

    /// Convert to a [`tera::Context`] for rendering.
    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        let value = serde_json::to_value(self)?;
        Ok(tera::Context::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiroctl_core::{services, RunMode, StackConfig};
    use std::path::{Path, PathBuf};

    fn identity() -> ServiceIdentity {
        ServiceIdentity {
            user: "kiro".to_string(),
            group: "kiro".to_string(),
        }
    }

    #[test]
    fn frontend_orders_after_backend_and_network() {
        let config = StackConfig {
            project_dir: PathBuf::from("/srv/kiro"),
            ..StackConfig::default()
        };
        let svc = services::frontend_service(&config, RunMode::Daemon, Path::new("/usr/bin/npm"));
        let ctx = UnitContext::from_service(&svc, &identity());
        assert_eq!(
            ctx.unit.after,
            vec!["network-online.target", "kiro-gateway.service"]
        );
        assert_eq!(ctx.exec.environment_file, None);
        assert_eq!(ctx.exec.environment[0].key, "NODE_ENV");
    }

    #[test]
    fn foreground_policy_is_not_rate_limited() {
        let config = StackConfig::default();
        let svc = services::backend_service(&config, RunMode::Foreground, &[]);
        let ctx = UnitContext::from_service(&svc, &identity());
        assert_eq!(ctx.restart.policy, "no");
        assert!(!ctx.restart.limited);
    }

    #[test]
    fn tera_context_conversion_succeeds() {
        let svc = services::backend_service(&StackConfig::default(), RunMode::Daemon, &[]);
        UnitContext::from_service(&svc, &identity())
            .to_tera_context()
            .expect("tera context");
    }
}
