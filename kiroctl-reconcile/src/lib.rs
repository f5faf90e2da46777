//! # kiroctl-reconcile
//!
//! Converges host state toward what the stack needs:
//!
//! - [`reclaim`]: free TCP ports held by stray processes.
//! - [`environment`]: runtime gate, virtualenv, dependencies, `.env`, frontend.
//! - [`firewall`]: open / close the daemon ports through the active firewall.
//! - [`writer`] / [`diff`]: content-gated descriptor writes and dry-run diffs.

pub mod diff;
pub mod environment;
pub mod error;
pub mod firewall;
pub mod reclaim;
pub mod writer;

pub use diff::{unit_diff, FileDiff};
pub use environment::{
    ensure_environment, AssumeYes, ConfigFileState, Confirm, DependencyState, EnvironmentReport,
    FrontendState, VenvState,
};
pub use error::ReconcileError;
pub use firewall::{close_ports, open_ports, FirewallBackend, FirewallReport, RuleOutcome};
pub use reclaim::{kill_matching, reclaim, ReclaimResult};
pub use writer::{remove_unit, write_unit, WriteResult};
