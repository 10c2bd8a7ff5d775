//! Configuration file (TOML) and its mapping onto component configs.
//!
//! ```toml
//! secret = "correct horse battery staple"
//! io_timeout_secs = 30
//!
//! [server]
//! bind = "0.0.0.0:7878"
//! root = "~/hashsync/store"
//! max_connections = 64
//! announce_ttl_secs = 300   # 0 disables expiry
//!
//! [client]
//! server = "10.0.0.2:7878"
//! root = "~/hashsync/local"
//! poll_interval_secs = 5
//! workers = 4
//! push_existing = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::error::{Result, SyncError};
use crate::fsutil::expand_tilde;
use crate::monitor::MonitorConfig;
use crate::server::ServerConfig;

pub const DEFAULT_PORT: u16 = 7878;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Shared secret keying the frame cipher
    pub secret: Option<String>,
    pub io_timeout_secs: u64,
    pub server: ServerSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
    pub root: Option<PathBuf>,
    pub max_connections: usize,
    pub announce_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub server: String,
    pub root: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub workers: usize,
    pub push_existing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: None,
            io_timeout_secs: 30,
            server: ServerSection::default(),
            client: ClientSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            root: None,
            max_connections: 64,
            announce_ttl_secs: 300,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", DEFAULT_PORT),
            root: None,
            poll_interval_secs: 5,
            workers: num_cpus::get(),
            push_existing: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    /// The shared secret as cipher key material. Required.
    pub fn key(&self) -> Result<Bytes> {
        match self.secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(Bytes::copy_from_slice(secret.as_bytes())),
            _ => Err(SyncError::Config(
                "no shared secret configured (set `secret` or HASHSYNC_SECRET)".into(),
            )),
        }
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let root = self
            .server
            .root
            .as_deref()
            .ok_or_else(|| SyncError::Config("server root not configured".into()))?;

        Ok(ServerConfig {
            root: expand_tilde(root),
            max_connections: self.server.max_connections.max(1),
            io_timeout: self.io_timeout(),
            announce_ttl: match self.server.announce_ttl_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let root = self
            .client
            .root
            .as_deref()
            .ok_or_else(|| SyncError::Config("client root not configured".into()))?;

        Ok(ClientConfig {
            server: self.client.server.clone(),
            root: expand_tilde(root),
            io_timeout: self.io_timeout(),
        })
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.client.poll_interval_secs.max(1)),
            workers: self.client.workers.max(1),
            push_existing: self.client.push_existing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind, "0.0.0.0:7878");
        assert!(config.key().is_err());
        assert!(config.server_config().is_err());
    }

    #[test]
    fn test_full_file() {
        let config = Config::parse(
            r#"
            secret = "s3cret"
            io_timeout_secs = 10

            [server]
            root = "/srv/store"
            max_connections = 8
            announce_ttl_secs = 0

            [client]
            server = "10.0.0.2:9000"
            root = "/home/me/sync"
            workers = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.key().unwrap().as_ref(), b"s3cret");

        let server = config.server_config().unwrap();
        assert_eq!(server.root, PathBuf::from("/srv/store"));
        assert_eq!(server.max_connections, 8);
        assert_eq!(server.announce_ttl, None);
        assert_eq!(server.io_timeout, Duration::from_secs(10));

        let client = config.client_config().unwrap();
        assert_eq!(client.server, "10.0.0.2:9000");
        assert_eq!(config.monitor_config().workers, 3);
        assert_eq!(config.monitor_config().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::parse("sekret = \"typo\"").is_err());
    }
}
