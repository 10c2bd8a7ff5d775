//! Background monitor - runs when invoked as `hashsync watch`
//!
//! Polls the local root. Each tick pushes files that appeared or changed since
//! the last successful push (bounded worker pool), then runs one pull-sync
//! against the server. Failures are logged and retried on the next tick.

pub mod in_flight;

pub use in_flight::InFlightSet;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::client::{PullReport, SyncClient};
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::index::{ScannedFile, Scanner};

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between ticks
    pub poll_interval: Duration,
    /// Concurrent uploads
    pub workers: usize,
    /// Push files already present at startup instead of only new ones
    pub push_existing: bool,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Relative path -> content hash for every file under a root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: HashMap<String, ContentHash>,
}

impl Snapshot {
    pub fn from_scan(files: Vec<ScannedFile>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|f| (f.relative_path, f.hash))
                .collect(),
        }
    }

    pub fn insert(&mut self, relative_path: String, hash: ContentHash) {
        self.files.insert(relative_path, hash);
    }

    pub fn contains(&self, relative_path: &str, hash: &ContentHash) -> bool {
        self.files.get(relative_path) == Some(hash)
    }

    /// Entries of `self` that `previous` does not hold with the same content,
    /// sorted by path.
    pub fn new_since(&self, previous: &Snapshot) -> Vec<(String, ContentHash)> {
        let mut fresh: Vec<_> = self
            .files
            .iter()
            .filter(|(path, hash)| !previous.contains(path, hash))
            .map(|(path, hash)| (path.clone(), *hash))
            .collect();
        fresh.sort();
        fresh
    }

    /// Forget paths that no longer exist in `current`.
    pub fn retain_present(&mut self, current: &Snapshot) {
        self.files.retain(|path, _| current.files.contains_key(path));
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Uploads scheduled this tick
    pub scheduled: usize,
    /// Files written by this tick's pull
    pub pulled: usize,
}

pub struct Monitor {
    root: PathBuf,
    config: MonitorConfig,
    client: Arc<SyncClient>,
    workers: Arc<Semaphore>,
    in_flight: Arc<InFlightSet>,
    previous: Arc<Mutex<Snapshot>>,
    uploads: JoinSet<()>,
}

impl Monitor {
    /// Create a monitor over the client's root. Fails if the root is not a
    /// directory.
    pub async fn new(config: MonitorConfig, client: Arc<SyncClient>) -> Result<Self> {
        let root = client.root().to_path_buf();
        if !root.is_dir() {
            return Err(SyncError::Config(format!(
                "sync root is not a directory: {}",
                root.display()
            )));
        }

        let previous = if config.push_existing {
            Snapshot::default()
        } else {
            scan_snapshot(&root).await?
        };
        tracing::info!(
            "Monitoring {} ({} files known, {} workers)",
            root.display(),
            previous.len(),
            config.workers
        );

        Ok(Self {
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            in_flight: Arc::new(InFlightSet::new()),
            previous: Arc::new(Mutex::new(previous)),
            uploads: JoinSet::new(),
            root,
            config,
            client,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_flight(&self) -> &Arc<InFlightSet> {
        &self.in_flight
    }

    /// Files known to be on the server or pulled from it
    pub fn snapshot(&self) -> Snapshot {
        self.previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Poll forever.
    pub async fn run(&mut self) {
        self.run_until(std::future::pending()).await
    }

    /// Poll until `shutdown` resolves, then wait for running uploads.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.tick().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("Monitor stopping, waiting for {} uploads", self.in_flight.len());
        self.wait_idle().await;
    }

    /// One polling cycle: schedule uploads, then pull. Never fails; errors
    /// are logged and the work is retried next tick.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        match self.check_uploads().await {
            Ok(scheduled) => report.scheduled = scheduled,
            Err(e) => tracing::warn!("Upload check failed: {}", e),
        }

        match self.pull().await {
            Ok(pull) => report.pulled = pull.saved.len(),
            Err(e) => tracing::warn!(
                "Pull from {} failed, retrying next poll: {}",
                self.client.server(),
                e
            ),
        }

        report
    }

    /// Rescan the root and schedule a push for every new or changed file not
    /// already in flight. Returns the number of uploads scheduled.
    pub async fn check_uploads(&mut self) -> Result<usize> {
        self.reap_uploads();

        let current = scan_snapshot(&self.root).await?;
        let fresh = {
            let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
            previous.retain_present(&current);
            current.new_since(&previous)
        };

        let mut scheduled = 0;
        for (rel, hash) in fresh {
            if !self.in_flight.try_insert(&rel) {
                continue;
            }
            scheduled += 1;
            self.spawn_upload(rel, hash);
        }

        if scheduled > 0 {
            tracing::debug!("Scheduled {} uploads", scheduled);
        }
        Ok(scheduled)
    }

    fn spawn_upload(&mut self, rel: String, hash: ContentHash) {
        let client = Arc::clone(&self.client);
        let workers = Arc::clone(&self.workers);
        let in_flight = Arc::clone(&self.in_flight);
        let previous = Arc::clone(&self.previous);

        self.uploads.spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                in_flight.remove(&rel);
                return;
            };

            match client.push_file(Path::new(&rel)).await {
                Ok(_) => previous
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(rel.clone(), hash),
                Err(SyncError::FrameTooLarge { size, max }) => {
                    tracing::warn!("{} is too large to push ({} > {} bytes)", rel, size, max);
                    previous
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(rel.clone(), hash);
                }
                Err(e) => tracing::warn!("Upload of {} failed, retrying next poll: {}", rel, e),
            }
            in_flight.remove(&rel);
        });
    }

    /// Run one pull-sync. Files it writes are recorded as known so they are
    /// not pushed back to the server.
    pub async fn pull(&mut self) -> Result<PullReport> {
        let report = self.client.pull_sync().await?;

        if !report.saved.is_empty() {
            let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
            for saved in &report.saved {
                previous.insert(saved.relative_path.clone(), saved.hash);
            }
        }
        Ok(report)
    }

    /// Wait for every scheduled upload to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(result) = self.uploads.join_next().await {
            if let Err(e) = result {
                tracing::error!("Upload task failed: {}", e);
            }
        }
    }

    fn reap_uploads(&mut self) {
        while let Some(result) = self.uploads.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Upload task failed: {}", e);
            }
        }
    }
}

async fn scan_snapshot(root: &Path) -> Result<Snapshot> {
    let scanner = Scanner::new(root.to_path_buf());
    let files = tokio::task::spawn_blocking(move || scanner.scan()).await??;
    Ok(Snapshot::from_scan(files))
}
