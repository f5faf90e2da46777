//! Content-gated atomic writes for service descriptors.
//!
//! ## `write_unit` protocol
//!
//! 1. Normalise line endings to LF.
//! 2. SHA-256 the new content and whatever is on disk.
//! 3. Equal digests → `Unchanged`, the file (and its mtime) is left alone.
//! 4. Write to `<path>.kiroctl.tmp`, then rename over the final path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{io_err, ReconcileError};

/// Outcome of an individual descriptor write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Content changed or the file did not exist.
    Written { path: PathBuf },
    /// On-disk content already matches.
    Unchanged { path: PathBuf },
}

impl WriteResult {
    pub fn path(&self) -> &Path {
        match self {
            WriteResult::Written { path } | WriteResult::Unchanged { path } => path,
        }
    }

    pub fn written(&self) -> bool {
        matches!(self, WriteResult::Written { .. })
    }
}

pub(crate) fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}

fn digest(content: &str) -> String {
    let mut h = Sha256::new();
    h.update(content.as_bytes());
    hex::encode(h.finalize())
}

/// Digest of the file at `path`, `None` when it does not exist.
fn digest_on_disk(path: &Path) -> Result<Option<String>, ReconcileError> {
    match std::fs::read_to_string(path) {
        Ok(existing) => Ok(Some(digest(&normalize_line_endings(&existing)))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Write `content` to `path` unless the file already holds exactly that.
pub fn write_unit(path: &Path, content: &str) -> Result<WriteResult, ReconcileError> {
    let tmp = PathBuf::from(format!("{}.kiroctl.tmp", path.display()));
    write_unit_with_tmp(path, content, &tmp)
}

fn write_unit_with_tmp(
    path: &Path,
    content: &str,
    tmp: &Path,
) -> Result<WriteResult, ReconcileError> {
    let content = normalize_line_endings(content);

    if digest_on_disk(path)?.as_deref() == Some(digest(&content).as_str()) {
        tracing::debug!(path = %path.display(), "unchanged");
        return Ok(WriteResult::Unchanged {
            path: path.to_path_buf(),
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::write(tmp, &content).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }

    tracing::info!(path = %path.display(), "wrote");
    Ok(WriteResult::Written {
        path: path.to_path_buf(),
    })
}

/// Delete a descriptor. `Ok(false)` when there was nothing to delete.
pub fn remove_unit(path: &Path) -> Result<bool, ReconcileError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn first_write_returns_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kiro-gateway.service");
        let result = write_unit(&path, "[Unit]\n").unwrap();
        assert!(result.written());
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Unit]\n");
    }

    #[test]
    fn same_content_is_unchanged_and_keeps_mtime() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kiro-gateway.service");
        write_unit(&path, "[Unit]\n").unwrap();
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        let result = write_unit(&path, "[Unit]\n").unwrap();
        assert!(matches!(result, WriteResult::Unchanged { .. }));
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn changed_content_is_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("unit.service");
        write_unit(&path, "v1\n").unwrap();
        assert!(write_unit(&path, "v2\n").unwrap().written());
        assert_eq!(fs::read_to_string(&path).unwrap(), "v2\n");
    }

    #[test]
    fn crlf_matches_lf_on_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("unit.service");
        write_unit(&path, "a\r\nb\r\n").unwrap();
        assert!(!write_unit(&path, "a\nb\n").unwrap().written());
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn tmp_file_removed_after_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clean.service");
        write_unit(&path, "data").unwrap();
        assert!(!tmp.path().join("clean.service.kiroctl.tmp").exists());
    }

    #[test]
    #[cfg(unix)]
    fn rename_failure_leaves_original_and_cleans_tmp() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let readonly_dir = root.path().join("readonly");
        fs::create_dir_all(&readonly_dir).unwrap();
        let path = readonly_dir.join("unit.service");
        fs::write(&path, "original").unwrap();

        let mut perms = fs::metadata(&readonly_dir).unwrap().permissions();
        perms.set_mode(0o555);
        fs::set_permissions(&readonly_dir, perms).unwrap();

        let tmp_dir = TempDir::new().unwrap();
        let tmp_path = tmp_dir.path().join("unit.service.kiroctl.tmp");
        let result = write_unit_with_tmp(&path, "new content", &tmp_path);

        let mut perms = fs::metadata(&readonly_dir).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&readonly_dir, perms).unwrap();

        // root ignores directory permissions; only assert when the rename failed
        if result.is_err() {
            assert_eq!(fs::read_to_string(&path).unwrap(), "original");
            assert!(!tmp_path.exists());
        }
    }

    #[test]
    fn remove_missing_is_false() {
        let tmp = TempDir::new().unwrap();
        assert!(!remove_unit(&tmp.path().join("absent.service")).unwrap());
    }
}
