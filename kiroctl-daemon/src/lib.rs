//! Foreground supervision and systemd service management.

mod error;
pub mod runtime;
pub mod systemd;

pub use error::DaemonError;
pub use runtime::{run_foreground, BackendArgs, ExitReason, Supervisor, SupervisorState};
pub use systemd::{
    install, logs, plan, status, uninstall, InstallReport, Plan, ServiceStatus, Step,
    StepOutcome, UninstallReport, UnitState,
};
