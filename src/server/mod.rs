//! Sync server - runs when invoked as `hashsync serve`
//!
//! Accepts one request per TCP connection, answers it, and closes. Stores
//! pushed files under its root and answers sync queries from a content index
//! of that root.

pub mod announced;

pub use announced::AnnouncedSet;

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::error::{Result, SyncError};
use crate::fsutil::{ensure_dir, relative_path, validate_path, write_atomic};
use crate::hash::ContentHash;
use crate::index::{ContentIndex, FsContentIndex};
use crate::wire::{FilePayload, FrameCodec, Request, Response, SEQ_LEN_PREFIX};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory files are stored under
    pub root: PathBuf,
    /// Connections served concurrently; further clients wait in the backlog
    pub max_connections: usize,
    /// Bound on reading a request and writing its response
    pub io_timeout: Duration,
    /// How long an unrequested announcement suppresses a hash
    pub announce_ttl: Option<Duration>,
}

pub struct SyncServer {
    root: PathBuf,
    codec: FrameCodec,
    index: Arc<dyn ContentIndex>,
    announced: Arc<AnnouncedSet>,
    connections: Arc<Semaphore>,
    io_timeout: Duration,
}

impl SyncServer {
    /// Create a server over `config.root`, creating the root if missing.
    pub fn new(config: ServerConfig, codec: FrameCodec) -> Result<Self> {
        if config.root.exists() && !config.root.is_dir() {
            return Err(SyncError::Config(format!(
                "server root is not a directory: {}",
                config.root.display()
            )));
        }
        ensure_dir(&config.root)?;

        Ok(Self {
            index: Arc::new(FsContentIndex::new(config.root.clone())),
            announced: Arc::new(AnnouncedSet::new(config.announce_ttl)),
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            io_timeout: config.io_timeout,
            root: config.root,
            codec,
        })
    }

    /// Replace the content index (defaults to a filesystem index of the root).
    pub fn with_index(mut self, index: Arc<dyn ContentIndex>) -> Self {
        self.index = index;
        self
    }

    /// Share an announced-set with the caller.
    pub fn with_announced(mut self, announced: Arc<AnnouncedSet>) -> Self {
        self.announced = announced;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn announced(&self) -> &Arc<AnnouncedSet> {
        &self.announced
    }

    /// Accept connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// accepted run to completion on their own tasks.
    pub async fn serve_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Serving {} on {}", self.root.display(), addr);
        }

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.connections).acquire_owned() => permit
                    .map_err(|_| SyncError::Protocol("connection limiter closed".into()))?,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                match server.handle_connection(stream).await {
                    Ok(()) => {}
                    Err(e) if e.is_protocol() => {
                        tracing::warn!("Dropping connection from {}: {}", peer, e)
                    }
                    Err(e) => tracing::error!("Connection from {} failed: {}", peer, e),
                }
            });
        }

        tracing::info!("Server on {} stopped accepting", self.root.display());
        Ok(())
    }

    /// Serve exactly one request/response exchange on `stream`.
    ///
    /// Errors returned here are protocol or transport errors and only concern
    /// this connection. Failures while carrying out a well-formed request are
    /// reported to the client as `Response::Error`.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = timeout(self.io_timeout, self.codec.receive_request(&mut stream))
            .await
            .map_err(|_| SyncError::Timeout("request frame".into()))??;
        let command = request.command();
        tracing::debug!("Received {:?}", command);

        let response = match self.handle_request(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("{:?} failed: {}", command, e);
                Response::Error(e.to_string())
            }
        };

        timeout(self.io_timeout, self.codec.send_response(&mut stream, &response))
            .await
            .map_err(|_| SyncError::Timeout("response frame".into()))??;
        if let Err(e) = stream.shutdown().await {
            tracing::debug!("Shutdown after {:?} failed: {}", command, e);
        }

        Ok(())
    }

    /// Dispatch a decoded request.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        match request {
            Request::PushFile(file) => self.push_file(file).await,
            Request::MakeDirs(dirs) => self.make_dirs(dirs).await,
            Request::SyncCheck => self.sync_check().await,
            Request::SyncRequest(hashes) => self.sync_request(hashes).await,
        }
    }

    async fn push_file(&self, file: FilePayload) -> Result<Response> {
        let FilePayload { header, data } = file;
        let target = validate_path(&self.root, &header.relative_path)?;
        let size = data.len();

        tokio::task::spawn_blocking(move || write_atomic(&target, &data)).await??;

        tracing::info!("Stored {} ({} bytes)", header.relative_path, size);
        Ok(Response::Ack)
    }

    async fn make_dirs(&self, dirs: Vec<String>) -> Result<Response> {
        let targets = dirs
            .iter()
            .map(|d| validate_path(&self.root, d))
            .collect::<Result<Vec<_>>>()?;

        tokio::task::spawn_blocking(move || targets.iter().try_for_each(|t| ensure_dir(t)))
            .await??;

        tracing::debug!("Created {} directories", dirs.len());
        Ok(Response::Ack)
    }

    async fn sync_check(&self) -> Result<Response> {
        let index = Arc::clone(&self.index);
        let scanned = tokio::task::spawn_blocking(move || index.enumerate()).await??;

        let fresh = self.announced.announce(scanned.into_iter().map(|(hash, _)| hash));
        tracing::debug!("Announcing {} new hashes", fresh.len());
        Ok(Response::Announce(fresh))
    }

    /// Answer with as many requested files as fit in one frame. Hashes left
    /// out for space stay announced so the client can ask for them again;
    /// every other requested hash is forgotten.
    async fn sync_request(&self, hashes: BTreeSet<ContentHash>) -> Result<Response> {
        let index = Arc::clone(&self.index);
        let root = self.root.clone();
        let wanted = hashes.clone();
        let budget = self.codec.max_frame() as usize;

        let batch =
            tokio::task::spawn_blocking(move || collect_files(&*index, &root, &wanted, budget))
                .await??;

        self.announced.mark_delivered(hashes.difference(&batch.deferred));
        tracing::info!(
            "Delivering {} of {} requested files ({} deferred)",
            batch.files.len(),
            hashes.len(),
            batch.deferred.len()
        );
        Ok(Response::Files(batch.files))
    }
}

/// Files answering one sync request
#[derive(Debug, Default)]
struct Batch {
    files: Vec<FilePayload>,
    /// Resolvable hashes that did not fit in this response
    deferred: BTreeSet<ContentHash>,
}

/// Resolve and read requested hashes until the encoded `Files` body would
/// exceed `budget` bytes. Hashes that no longer resolve to a readable file
/// with that content are skipped, as are files too large for any frame.
fn collect_files(
    index: &dyn ContentIndex,
    root: &Path,
    hashes: &BTreeSet<ContentHash>,
    budget: usize,
) -> Result<Batch> {
    let paths = index.lookup_many(hashes)?;
    let mut batch = Batch::default();
    let mut used = SEQ_LEN_PREFIX;

    for hash in hashes {
        let Some(path) = paths.get(hash) else {
            tracing::warn!("{}", SyncError::NotFound(*hash));
            continue;
        };
        let rel = match relative_path(root, path) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len() as usize,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let overhead =
            SEQ_LEN_PREFIX + FilePayload::new(rel.as_str(), Vec::<u8>::new()).encoded_len()?;
        if SEQ_LEN_PREFIX + overhead + size > budget {
            tracing::warn!(
                "{} ({} bytes) does not fit in a frame, not delivering it",
                path.display(),
                size
            );
            continue;
        }
        if used + overhead + size > budget {
            batch.deferred.insert(*hash);
            continue;
        }

        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if ContentHash::from_bytes(&data) != *hash {
            tracing::warn!("{} changed before delivery", path.display());
            continue;
        }
        if used + overhead + data.len() > budget {
            batch.deferred.insert(*hash);
            continue;
        }

        used += overhead + data.len();
        batch.files.push(FilePayload::new(rel, data));
    }

    Ok(batch)
}
