use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the foreground supervisor and the systemd installer.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Reconcile(#[from] kiroctl_reconcile::ReconcileError),

    #[error("render error: {0}")]
    Render(#[from] kiroctl_renderer::RenderError),

    #[error("installing system services requires root; re-run with sudo")]
    NotElevated,

    #[error("could not determine which user the services should run as; set SUDO_USER")]
    IdentityUnresolved,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("signal handler setup failed: {0}")]
    Signals(#[source] std::io::Error),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
