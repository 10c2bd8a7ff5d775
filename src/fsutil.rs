//! Filesystem helpers shared by the server and the client.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

/// Suffix of the temp files used for atomic writes. The scanner skips these.
pub const TEMP_SUFFIX: &str = ".hashsync.tmp";

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

/// Validate that a wire-supplied relative path is safe and doesn't escape the
/// root. Returns the full path if valid.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SyncError::invalid_path(relative, "empty path"));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(SyncError::invalid_path(relative, "absolute path"));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(SyncError::invalid_path(relative, "path traversal"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(SyncError::invalid_path(relative, "rooted path"));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(SyncError::invalid_path(relative, "escapes root directory"));
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// Path of `path` relative to `root`, `/`-separated, as sent on the wire.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| SyncError::invalid_path(path, "not under sync root"))?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| SyncError::invalid_path(path, "not valid UTF-8"))?,
            ),
            Component::CurDir => {}
            _ => return Err(SyncError::invalid_path(path, "unexpected component")),
        }
    }

    if parts.is_empty() {
        return Err(SyncError::invalid_path(path, "is the sync root"));
    }
    Ok(parts.join("/"))
}

/// Recursively create a directory. An existing directory is not an error.
pub fn ensure_dir(path: &Path) -> Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write `data` to `path` through a sibling temp file and a rename, creating
/// parent directories as needed. Overwrites any existing file. Blocking.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::invalid_path(path, "no parent directory"))?;
    ensure_dir(parent)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
