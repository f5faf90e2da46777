//! kiroctl core library: domain types, stack configuration, host seam.
//!
//! Public API surface:
//! - [`types`]: newtypes and domain structs ([`Service`], [`Port`], ...)
//! - [`config`]: [`StackConfig`] load / save / defaults
//! - [`services`]: builds the backend and frontend [`Service`] values
//! - [`host`]: the [`Host`] trait every external effect goes through
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod host;
pub mod services;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use config::StackConfig;
pub use error::ConfigError;
pub use host::{CommandOutput, Host, HostCommand, SystemHost};
pub use types::{
    Component, Port, RestartPolicy, RunMode, Service, ServiceIdentity, ServiceName, Version,
};
