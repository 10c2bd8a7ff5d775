//! Error types for hashsync

use std::path::PathBuf;

use thiserror::Error;

use crate::hash::ContentHash;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown command byte: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Frame size {size} exceeds maximum allowed size {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Connection closed after {received} of {expected} bytes")]
    ConnectionClosed { received: usize, expected: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Content not found: {0}")]
    NotFound(ContentHash),

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that only concern the current connection: the peer broke the
    /// framing contract or went away.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::UnknownCommand(_)
                | Self::FrameTooLarge { .. }
                | Self::ConnectionClosed { .. }
                | Self::Serialization(_)
                | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
