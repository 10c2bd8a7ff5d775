//! hashsync - push new files, pull missing files.
//!
//! A TCP server stores files under a root directory. Clients push files they
//! create locally and pull content the server has that they lack, keyed by
//! BLAKE3 content hash.
//!
//! ```text
//!  local root                                     server root
//! +----------+   push (PushFile)              +-------------+
//! | Monitor  | -----------------------------> | SyncServer  |
//! |  scan    |   pull (SyncCheck/SyncRequest) |  index      |
//! |  client  | <----------------------------> |  announced  |
//! +----------+                                +-------------+
//! ```

pub mod cipher;
pub mod client;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod hash;
pub mod index;
pub mod monitor;
pub mod server;
pub mod wire;

pub use cipher::{Cipher, KeystreamCipher};
pub use client::{missing_hashes, ClientConfig, PullReport, SavedFile, SyncClient};
pub use config::Config;
pub use error::{Result, SyncError};
pub use hash::ContentHash;
pub use index::{ContentIndex, FsContentIndex, Scanner};
pub use monitor::{InFlightSet, Monitor, MonitorConfig, Snapshot, TickReport};
pub use server::{AnnouncedSet, ServerConfig, SyncServer};
pub use wire::{Command, FileHeader, FilePayload, FrameCodec, Request, Response};
