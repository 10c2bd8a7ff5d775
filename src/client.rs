//! Sync client - one short-lived TCP connection per remote call.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Result, SyncError};
use crate::fsutil::{relative_path, validate_path, write_atomic};
use crate::hash::ContentHash;
use crate::index::Scanner;
use crate::wire::{FilePayload, FrameCodec, Request, Response};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub server: String,
    /// Local sync root
    pub root: PathBuf,
    /// Bound on connecting, and separately on the request/response exchange
    pub io_timeout: Duration,
}

/// A file written locally by a pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedFile {
    pub relative_path: String,
    #[serde(serialize_with = "hex_hash")]
    pub hash: ContentHash,
    pub size: u64,
}

/// Outcome of one pull-sync cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct PullReport {
    /// Hashes the server announced in this cycle
    pub announced: usize,
    /// Announced hashes missing locally
    pub needed: usize,
    pub saved: Vec<SavedFile>,
    /// Delivered files that could not be written
    pub failed: usize,
}

fn hex_hash<S: Serializer>(hash: &ContentHash, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hash.to_hex())
}

/// Hashes present in the remote report and absent locally.
pub fn missing_hashes(
    remote: &BTreeSet<ContentHash>,
    local: &BTreeSet<ContentHash>,
) -> BTreeSet<ContentHash> {
    remote.difference(local).copied().collect()
}

fn unexpected(expected: &str, got: &Response) -> SyncError {
    SyncError::Protocol(format!("expected {}, got {:?}", expected, got.command()))
}

pub struct SyncClient {
    server: String,
    root: PathBuf,
    codec: FrameCodec,
    io_timeout: Duration,
}

impl SyncClient {
    pub fn new(config: ClientConfig, codec: FrameCodec) -> Self {
        Self {
            server: config.server,
            root: config.root,
            codec,
            io_timeout: config.io_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Open a connection, send one request, read one response, close.
    ///
    /// The stream is dropped on every path out of this function. A
    /// `Response::Error` from the server is returned as `SyncError::Remote`.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = timeout(self.io_timeout, TcpStream::connect(&self.server))
            .await
            .map_err(|_| SyncError::Timeout(format!("connect to {}", self.server)))??;

        let exchange = async {
            self.codec.send_request(&mut stream, request).await?;
            self.codec.receive_response(&mut stream).await
        };
        let response = timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout(format!("{:?} reply", request.command())))??;

        match response {
            Response::Error(message) => Err(SyncError::Remote(message)),
            other => Ok(other),
        }
    }

    /// Upload one file. `path` is absolute or relative to the client root.
    /// Returns the full path that was pushed.
    pub async fn push_file(&self, path: &Path) -> Result<PathBuf> {
        let (full, rel) = self.wire_path(path).await?;
        let data = tokio::fs::read(&full).await?;
        let size = data.len();

        match self
            .call(&Request::PushFile(FilePayload::new(rel.clone(), data)))
            .await?
        {
            Response::Ack => {
                tracing::info!("Pushed {} ({} bytes)", rel, size);
                Ok(full)
            }
            other => Err(unexpected("Ack", &other)),
        }
    }

    /// On-disk location of `path` (absolute, or relative to the root) and its
    /// `/`-separated path relative to the root. Both sides are canonicalized,
    /// so `.`/`..` components and a relative root compare correctly.
    async fn wire_path(&self, path: &Path) -> Result<(PathBuf, String)> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let root = tokio::fs::canonicalize(&self.root).await?;
        let resolved = tokio::fs::canonicalize(&full).await?;
        let rel = relative_path(&root, &resolved)?;
        Ok((full, rel))
    }

    /// Create directories on the server, relative to its root.
    pub async fn make_directories(&self, dirs: Vec<String>) -> Result<()> {
        match self.call(&Request::MakeDirs(dirs)).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }

    /// Write a delivered file under the local root.
    pub async fn save_file(&self, file: FilePayload) -> Result<SavedFile> {
        let FilePayload { header, data } = file;
        let target = validate_path(&self.root, &header.relative_path)?;
        let hash = ContentHash::from_bytes(&data);
        let size = data.len() as u64;

        tokio::task::spawn_blocking(move || write_atomic(&target, &data)).await??;

        Ok(SavedFile {
            relative_path: header.relative_path,
            hash,
            size,
        })
    }

    /// Two-phase pull: ask what the server has not announced yet, request
    /// whatever of that is missing locally, and write what comes back. The
    /// server answers with at most one frame of files, so requests repeat
    /// until everything needed has arrived or a round delivers nothing new.
    pub async fn pull_sync(&self) -> Result<PullReport> {
        let remote_new = match self.call(&Request::SyncCheck).await? {
            Response::Announce(hashes) => hashes,
            other => return Err(unexpected("Announce", &other)),
        };

        let scanner = Scanner::new(self.root.clone());
        let local = tokio::task::spawn_blocking(move || scanner.hashes()).await??;

        let needed = missing_hashes(&remote_new, &local);
        let mut report = PullReport {
            announced: remote_new.len(),
            needed: needed.len(),
            ..Default::default()
        };
        if needed.is_empty() {
            tracing::debug!("Nothing to pull ({} announced)", report.announced);
            return Ok(report);
        }

        let mut remaining = needed;
        while !remaining.is_empty() {
            let files = match self.call(&Request::SyncRequest(remaining.clone())).await? {
                Response::Files(files) => files,
                other => return Err(unexpected("Files", &other)),
            };

            let before = remaining.len();
            for file in files {
                remaining.remove(&ContentHash::from_bytes(&file.data));
                let rel = file.header.relative_path.clone();
                match self.save_file(file).await {
                    Ok(saved) => {
                        tracing::info!("Pulled {} ({} bytes)", saved.relative_path, saved.size);
                        report.saved.push(saved);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to save pulled file {}: {}", rel, e);
                        report.failed += 1;
                    }
                }
            }
            if remaining.len() == before {
                break;
            }
        }

        if !remaining.is_empty() {
            tracing::debug!("{} needed files were not delivered", remaining.len());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hashes(items: &[&str]) -> BTreeSet<ContentHash> {
        items
            .iter()
            .map(|s| ContentHash::from_bytes(s.as_bytes()))
            .collect()
    }

    fn client(root: &Path) -> SyncClient {
        SyncClient::new(
            ClientConfig {
                server: "127.0.0.1:9".into(),
                root: root.to_path_buf(),
                io_timeout: Duration::from_secs(2),
            },
            FrameCodec::new(&b"k"[..]),
        )
    }

    #[test]
    fn test_missing_hashes_is_remote_minus_local() {
        let remote = hashes(&["a", "b", "c"]);
        let local = hashes(&["b", "d"]);
        assert_eq!(missing_hashes(&remote, &local), hashes(&["a", "c"]));
    }

    #[test]
    fn test_missing_hashes_empty_when_identical() {
        let state = hashes(&["a", "b"]);
        assert!(missing_hashes(&state, &state).is_empty());
        assert!(missing_hashes(&BTreeSet::new(), &state).is_empty());
    }

    #[tokio::test]
    async fn test_save_file_writes_under_root() {
        let tmp = TempDir::new().unwrap();
        let client = client(tmp.path());

        let saved = client
            .save_file(FilePayload::new("x/y/z.txt", &b"zulu"[..]))
            .await
            .unwrap();

        assert_eq!(saved.relative_path, "x/y/z.txt");
        assert_eq!(saved.hash, ContentHash::from_bytes(b"zulu"));
        assert_eq!(saved.size, 4);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("x/y/z.txt")).unwrap(),
            "zulu"
        );
    }

    #[tokio::test]
    async fn test_save_file_rejects_escape() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp.path().join("root"));

        assert!(client
            .save_file(FilePayload::new("../../etc/evil", &b"x"[..]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_push_outside_root_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("f.txt"), "f").unwrap();

        let err = client(tmp.path())
            .push_file(&outside.path().join("f.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_wire_path_resolves_dot_segments_in_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("other")).unwrap();
        std::fs::create_dir(tmp.path().join("sync")).unwrap();
        std::fs::write(tmp.path().join("sync/a.txt"), "a").unwrap();

        let client = client(&tmp.path().join("other/../sync"));
        let (_, rel) = client
            .wire_path(&tmp.path().join("sync/a.txt"))
            .await
            .unwrap();
        assert_eq!(rel, "a.txt");

        let (full, rel) = client.wire_path(Path::new("a.txt")).await.unwrap();
        assert_eq!(rel, "a.txt");
        assert_eq!(std::fs::read_to_string(full).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept, then never answer
        let holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let tmp = TempDir::new().unwrap();
        let client = SyncClient::new(
            ClientConfig {
                server: addr.to_string(),
                root: tmp.path().to_path_buf(),
                io_timeout: Duration::from_millis(200),
            },
            FrameCodec::new(&b"k"[..]),
        );

        let started = std::time::Instant::now();
        let err = client.call(&Request::SyncCheck).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        holder.abort();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error_not_a_hang() {
        let tmp = TempDir::new().unwrap();
        let closed = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let client = SyncClient::new(
            ClientConfig {
                server: closed.to_string(),
                root: tmp.path().to_path_buf(),
                io_timeout: Duration::from_secs(2),
            },
            FrameCodec::new(&b"k"[..]),
        );

        assert!(client.pull_sync().await.is_err());
    }

    #[test]
    fn test_report_serializes_hex_hashes() {
        let report = PullReport {
            announced: 1,
            needed: 1,
            saved: vec![SavedFile {
                relative_path: "a.txt".into(),
                hash: ContentHash::from_bytes(b"hello"),
                size: 5,
            }],
            failed: 0,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json["saved"][0]["hash"],
            ContentHash::from_bytes(b"hello").to_hex()
        );
    }
}
