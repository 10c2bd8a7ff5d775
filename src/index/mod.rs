//! Content-addressable index over a sync root.

pub mod scanner;

pub use scanner::{ScannedFile, Scanner};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::hash::ContentHash;

/// Maps content hashes to the files that currently hold them.
pub trait ContentIndex: Send + Sync {
    /// Path of a file whose content hashed to `hash`, if any. The file may
    /// have changed since; callers that read it must re-check the content.
    fn lookup(&self, hash: &ContentHash) -> Result<Option<PathBuf>>;

    /// Resolve a batch of hashes. Hashes that do not resolve are absent from
    /// the result.
    fn lookup_many(
        &self,
        hashes: &BTreeSet<ContentHash>,
    ) -> Result<HashMap<ContentHash, PathBuf>> {
        let mut found = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(path) = self.lookup(hash)? {
                found.insert(*hash, path);
            }
        }
        Ok(found)
    }

    /// Every `(hash, path)` pair under the indexed root.
    fn enumerate(&self) -> Result<Vec<(ContentHash, PathBuf)>>;
}

/// Filesystem-backed index. Keeps the result of the last scan and rescans
/// when a lookup misses, at most once per lookup call.
pub struct FsContentIndex {
    scanner: Scanner,
    entries: Mutex<HashMap<ContentHash, PathBuf>>,
    scans: AtomicU64,
}

impl FsContentIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            scanner: Scanner::new(root),
            entries: Mutex::new(HashMap::new()),
            scans: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    /// Full scans performed so far
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    fn cached(&self, hash: &ContentHash) -> Option<PathBuf> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }
}

impl ContentIndex for FsContentIndex {
    fn lookup(&self, hash: &ContentHash) -> Result<Option<PathBuf>> {
        if let Some(path) = self.cached(hash) {
            return Ok(Some(path));
        }

        self.enumerate()?;
        Ok(self.cached(hash))
    }

    fn lookup_many(
        &self,
        hashes: &BTreeSet<ContentHash>,
    ) -> Result<HashMap<ContentHash, PathBuf>> {
        let resolve = || {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            hashes
                .iter()
                .filter_map(|h| entries.get(h).map(|p| (*h, p.clone())))
                .collect::<HashMap<_, _>>()
        };

        let found = resolve();
        if found.len() == hashes.len() {
            return Ok(found);
        }

        self.enumerate()?;
        Ok(resolve())
    }

    fn enumerate(&self) -> Result<Vec<(ContentHash, PathBuf)>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let pairs: Vec<(ContentHash, PathBuf)> = self
            .scanner
            .scan()?
            .into_iter()
            .map(|f| (f.hash, f.path))
            .collect();

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        entries.extend(pairs.iter().cloned());

        Ok(pairs)
    }
}
