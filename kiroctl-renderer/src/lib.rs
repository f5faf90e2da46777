//! # kiroctl-renderer
//!
//! Tera-based engine that renders systemd service descriptors for the
//! backend and frontend of the stack.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use kiroctl_core::{services, RunMode, ServiceIdentity, StackConfig};
//! use kiroctl_renderer::UnitRenderer;
//!
//! fn render_backend(config: &StackConfig, identity: &ServiceIdentity) {
//!     if let Ok(renderer) = UnitRenderer::new(None) {
//!         let service = services::backend_service(config, RunMode::Daemon, &[]);
//!         if let Ok(unit) = renderer.render(&service, identity, Path::new("/etc/systemd/system")) {
//!             println!("{}: {} bytes", unit.path.display(), unit.content.len());
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use context::UnitContext;
pub use engine::{template_name, template_names, RenderedUnit, UnitRenderer};
pub use error::RenderError;
