//! Tera rendering engine: [`UnitRenderer`] and the template table.
//!
//! # Template mapping
//!
//! | Component | Template                | Output path                     |
//! |-----------|-------------------------|---------------------------------|
//! | Backend   | `backend.service.tera`  | `<unit_dir>/<backend>.service`  |
//! | Frontend  | `frontend.service.tera` | `<unit_dir>/<frontend>.service` |
//!
//! A user template directory may override any entry, partials included, by
//! providing a file at the same relative path (for example
//! `_partials/hardening.tera`). Other files in that directory are ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tera::Tera;

use kiroctl_core::{Component, Service, ServiceIdentity};

use crate::context::UnitContext;
use crate::error::RenderError;

// ---------------------------------------------------------------------------
// Embedded templates: baked into the binary at compile time via include_str!
// ---------------------------------------------------------------------------

/// Keyed by path relative to `templates/`, which is also the override path.
const TPLS: &[(&str, &str)] = &[
    ("_partials/header.tera", include_str!("templates/_partials/header.tera")),
    ("_partials/unit.tera", include_str!("templates/_partials/unit.tera")),
    ("_partials/exec.tera", include_str!("templates/_partials/exec.tera")),
    ("_partials/restart.tera", include_str!("templates/_partials/restart.tera")),
    ("_partials/hardening.tera", include_str!("templates/_partials/hardening.tera")),
    ("_partials/logging.tera", include_str!("templates/_partials/logging.tera")),
    ("backend.service.tera", include_str!("templates/backend.service.tera")),
    ("frontend.service.tera", include_str!("templates/frontend.service.tera")),
];

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Names of every embedded template, i.e. every path a user may override.
pub fn template_names() -> impl Iterator<Item = &'static str> {
    TPLS.iter().map(|(name, _)| *name)
}

fn load_overrides(dir: &Path) -> Result<Vec<(&'static str, String)>, RenderError> {
    let mut overrides = Vec::new();
    for name in template_names() {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|source| RenderError::Io {
            path: path.clone(),
            source,
        })?;
        overrides.push((name, content));
    }
    Ok(overrides)
}

fn build_tera(user_template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: BTreeMap<&str, String> = TPLS
        .iter()
        .map(|(name, content)| (*name, (*content).to_string()))
        .collect();
    if let Some(dir) = user_template_dir {
        templates.extend(load_overrides(dir)?);
    }

    let mut tera = Tera::default();
    tera.add_raw_templates(templates)?;
    Ok(tera)
}

/// Template used for a component's unit file.
pub fn template_name(component: Component) -> &'static str {
    match component {
        Component::Backend => "backend.service.tera",
        Component::Frontend => "frontend.service.tera",
    }
}

// ---------------------------------------------------------------------------
// UnitRenderer
// ---------------------------------------------------------------------------

/// A rendered service descriptor and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedUnit {
    pub path: PathBuf,
    pub content: String,
}

/// Tera-based renderer for systemd unit files.
///
/// Create once with [`UnitRenderer::new`] and reuse.
pub struct UnitRenderer {
    tera: Tera,
}

impl UnitRenderer {
    /// Embedded templates plus any overrides found in `user_template_dir`.
    pub fn new(user_template_dir: Option<&Path>) -> Result<Self, RenderError> {
        Ok(UnitRenderer {
            tera: build_tera(user_template_dir)?,
        })
    }

    /// Render `service` as `<unit_dir>/<name>.service`.
    ///
    /// Output uses LF line endings and always ends with exactly one newline.
    pub fn render(
        &self,
        service: &Service,
        identity: &ServiceIdentity,
        unit_dir: &Path,
    ) -> Result<RenderedUnit, RenderError> {
        let ctx = UnitContext::from_service(service, identity);
        self.render_with_context(&ctx, service.component, unit_dir)
    }

    /// Render using a caller-provided [`UnitContext`].
    pub fn render_with_context(
        &self,
        ctx: &UnitContext,
        component: Component,
        unit_dir: &Path,
    ) -> Result<RenderedUnit, RenderError> {
        let tera_ctx = ctx.to_tera_context()?;
        let rendered = self.tera.render(template_name(component), &tera_ctx)?;
        let mut content = rendered.replace("\r\n", "\n").trim_end().to_string();
        content.push('\n');
        Ok(RenderedUnit {
            path: unit_dir.join(format!("{}.service", ctx.unit.name)),
            content,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
