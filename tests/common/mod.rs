//! Shared helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hashsync::{ClientConfig, FrameCodec, ServerConfig, SyncClient, SyncServer};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const SECRET: &[u8] = b"integration secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<SyncServer>,
    handle: JoinHandle<hashsync::Result<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_server(root: &Path) -> TestServer {
    start_server_with(root, FrameCodec::new(SECRET)).await
}

pub async fn start_server_with(root: &Path, codec: FrameCodec) -> TestServer {
    let server = Arc::new(
        SyncServer::new(
            ServerConfig {
                root: root.to_path_buf(),
                max_connections: 8,
                io_timeout: Duration::from_secs(10),
                announce_ttl: None,
            },
            codec,
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(Arc::clone(&server).serve(listener));

    TestServer {
        addr,
        server,
        handle,
    }
}

pub fn client(addr: SocketAddr, root: &Path) -> SyncClient {
    client_with(addr, root, FrameCodec::new(SECRET), Duration::from_secs(10))
}

pub fn client_with(
    addr: SocketAddr,
    root: &Path,
    codec: FrameCodec,
    io_timeout: Duration,
) -> SyncClient {
    SyncClient::new(
        ClientConfig {
            server: addr.to_string(),
            root: root.to_path_buf(),
            io_timeout,
        },
        codec,
    )
}
