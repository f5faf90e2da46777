//! Dry-run unified diffs of rendered descriptors against the installed ones.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use similar::TextDiff;

use crate::error::{io_err, ReconcileError};
use crate::writer::normalize_line_endings;

/// A single descriptor diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    /// The descriptor does not exist yet.
    pub new_file: bool,
    pub unified_diff: String,
}

/// Compare `rendered` with the file at `path`. `None` when identical.
///
/// Nothing is written.
pub fn unit_diff(path: &Path, rendered: &str) -> Result<Option<FileDiff>, ReconcileError> {
    let rendered = normalize_line_endings(rendered);
    let (existing, new_file) = match std::fs::read_to_string(path) {
        Ok(content) => (normalize_line_endings(&content), false),
        Err(err) if err.kind() == ErrorKind::NotFound => (String::new(), true),
        Err(err) => return Err(io_err(path, err)),
    };
    if existing == rendered {
        return Ok(None);
    }

    let old_header = if new_file {
        "/dev/null".to_string()
    } else {
        format!("a{}", path.display())
    };
    let new_header = format!("b{}", path.display());
    let unified_diff = TextDiff::from_lines(&existing, &rendered)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string();

    Ok(Some(FileDiff {
        path: path.to_path_buf(),
        new_file,
        unified_diff,
    }))
}
