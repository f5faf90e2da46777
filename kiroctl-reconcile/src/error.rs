//! Error types for kiroctl-reconcile.

use std::path::PathBuf;

use thiserror::Error;

use kiroctl_detector::DetectError;

/// Errors from environment reconciliation and descriptor writes.
///
/// Only the variants that stop an operation live here. Reclamation and
/// firewall failures are logged and reported, never returned.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Runtime gate or probe failure.
    #[error(transparent)]
    Detect(#[from] DetectError),

    /// Neither the configuration file nor its template exists.
    #[error("{path} is missing and no template was found at {template}; create {path} before starting")]
    TemplateMissing { path: PathBuf, template: PathBuf },

    /// The operator declined to continue after the configuration file was seeded.
    #[error("aborted: review {path} and start again")]
    Declined { path: PathBuf },

    #[error("could not create the virtualenv at {path}: {detail}")]
    VenvCreate { path: PathBuf, detail: String },

    #[error("installing {manifest} failed: {detail}; fix the manifest or install the packages manually")]
    DependencyInstall { manifest: PathBuf, detail: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`ReconcileError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ReconcileError {
    ReconcileError::Io {
        path: path.into(),
        source,
    }
}
