//! Directory scanner: walks a sync root and hashes every regular file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use rayon::prelude::*;

use crate::error::{Result, SyncError};
use crate::fsutil::{relative_path, TEMP_SUFFIX};
use crate::hash::ContentHash;

/// A regular file found under the scan root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Content hash (BLAKE3)
    pub hash: ContentHash,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated
    pub relative_path: String,
}

pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the root and hash every regular file. Blocking; hashing runs on
    /// the rayon pool.
    ///
    /// Hidden files are included and ignore files are not honored: the sync
    /// root is mirrored as-is. Symlinks are not followed. Files that vanish
    /// or cannot be read between the walk and the hash are skipped.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        if !self.root.is_dir() {
            return Err(SyncError::Config(format!(
                "sync root is not a directory: {}",
                self.root.display()
            )));
        }

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .follow_links(false)
            .build();

        let mut paths = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable entry under {}: {}",
                        self.root.display(),
                        e
                    );
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            paths.push(entry.into_path());
        }

        let files: Vec<Option<ScannedFile>> = paths
            .into_par_iter()
            .map(|path| self.hash_entry(path))
            .collect::<Result<_>>()?;

        Ok(files.into_iter().flatten().collect())
    }

    /// Content hashes of every file under the root
    pub fn hashes(&self) -> Result<BTreeSet<ContentHash>> {
        Ok(self.scan()?.into_iter().map(|f| f.hash).collect())
    }

    fn hash_entry(&self, path: PathBuf) -> Result<Option<ScannedFile>> {
        let relative_path = match relative_path(&self.root, &path) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        match ContentHash::from_file(&path) {
            Ok(hash) => Ok(Some(ScannedFile {
                hash,
                path,
                relative_path,
            })),
            Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} vanished during scan", path.display());
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Skipping unreadable {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}
