//! Message schema carried inside frames.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Frame format: command:u8 | len:u32 | enciphered payload
//!
//! Structured bodies (headers, path lists, hash sets) are bincode-encoded.
//! A file payload is `header_len:u32 | bincode(FileHeader) | raw bytes`.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;

/// Body of a sync-query "check" request
pub const CHECK_MARKER: &str = "check";

/// bincode length prefix of a sequence (u64)
pub const SEQ_LEN_PREFIX: usize = 8;

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    PushFile = 0x01,
    MakeDirs = 0x02,
    SyncCheck = 0x03,
    SyncRequest = 0x04,
    Ack = 0x10,
    Announce = 0x11,
    Files = 0x12,
    Error = 0x1F,
}

impl Command {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::PushFile),
            0x02 => Some(Self::MakeDirs),
            0x03 => Some(Self::SyncCheck),
            0x04 => Some(Self::SyncRequest),
            0x10 => Some(Self::Ack),
            0x11 => Some(Self::Announce),
            0x12 => Some(Self::Files),
            0x1F => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        (self as u8) < 0x10
    }
}

// =============================================================================
// File payloads
// =============================================================================

/// Where a file payload lands, relative to a sync root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub name: String,
    pub relative_path: String,
}

impl FileHeader {
    pub fn new(relative_path: impl Into<String>) -> Self {
        let relative_path = relative_path.into();
        let name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            relative_path,
        }
    }
}

/// A file header followed by the file's raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub header: FileHeader,
    pub data: Bytes,
}

impl FilePayload {
    pub fn new(relative_path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            header: FileHeader::new(relative_path),
            data: data.into(),
        }
    }

    /// Size of `encode()`'s output, without encoding the data.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(4 + bincode::serialized_size(&self.header)? as usize + self.data.len())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let header = bincode::serialize(&self.header)?;
        let mut buf = BytesMut::with_capacity(4 + header.len() + self.data.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(SyncError::Protocol("file payload too short".into()));
        }
        let header_len = payload.get_u32() as usize;
        if payload.remaining() < header_len {
            return Err(SyncError::Protocol(format!(
                "file header truncated: expected {} bytes, got {}",
                header_len,
                payload.remaining()
            )));
        }
        let header: FileHeader = bincode::deserialize(&payload.split_to(header_len))?;

        Ok(Self {
            header,
            data: payload,
        })
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Store a file under the server root
    PushFile(FilePayload),
    /// Create directories (relative to the server root)
    MakeDirs(Vec<String>),
    /// Which hashes do you have that you haven't announced yet?
    SyncCheck,
    /// Send me the files holding these hashes
    SyncRequest(BTreeSet<ContentHash>),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Self::PushFile(_) => Command::PushFile,
            Self::MakeDirs(_) => Command::MakeDirs,
            Self::SyncCheck => Command::SyncCheck,
            Self::SyncRequest(_) => Command::SyncRequest,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(match self {
            Self::PushFile(file) => file.encode()?,
            Self::MakeDirs(dirs) => bincode::serialize(dirs)?.into(),
            Self::SyncCheck => bincode::serialize(CHECK_MARKER)?.into(),
            Self::SyncRequest(hashes) => bincode::serialize(hashes)?.into(),
        })
    }

    pub fn decode(command: Command, payload: Bytes) -> Result<Self> {
        match command {
            Command::PushFile => Ok(Self::PushFile(FilePayload::decode(payload)?)),
            Command::MakeDirs => Ok(Self::MakeDirs(bincode::deserialize(&payload)?)),
            Command::SyncCheck => {
                let marker: String = bincode::deserialize(&payload)?;
                if marker != CHECK_MARKER {
                    return Err(SyncError::Protocol(format!(
                        "unexpected sync-check marker {:?}",
                        marker
                    )));
                }
                Ok(Self::SyncCheck)
            }
            Command::SyncRequest => Ok(Self::SyncRequest(bincode::deserialize(&payload)?)),
            other => Err(SyncError::Protocol(format!(
                "expected a request, got {:?}",
                other
            ))),
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    /// Hashes not previously announced
    Announce(BTreeSet<ContentHash>),
    /// Requested files that still resolved on the server
    Files(Vec<FilePayload>),
    /// The request was understood but could not be carried out
    Error(String),
}

impl Response {
    pub fn command(&self) -> Command {
        match self {
            Self::Ack => Command::Ack,
            Self::Announce(_) => Command::Announce,
            Self::Files(_) => Command::Files,
            Self::Error(_) => Command::Error,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(match self {
            Self::Ack => Bytes::new(),
            Self::Announce(hashes) => bincode::serialize(hashes)?.into(),
            Self::Files(files) => {
                let encoded = files
                    .iter()
                    .map(|f| f.encode().map(|b| b.to_vec()))
                    .collect::<Result<Vec<Vec<u8>>>>()?;
                bincode::serialize(&encoded)?.into()
            }
            Self::Error(message) => bincode::serialize(message)?.into(),
        })
    }

    pub fn decode(command: Command, payload: Bytes) -> Result<Self> {
        match command {
            Command::Ack => Ok(Self::Ack),
            Command::Announce => Ok(Self::Announce(bincode::deserialize(&payload)?)),
            Command::Files => {
                let encoded: Vec<Vec<u8>> = bincode::deserialize(&payload)?;
                let files = encoded
                    .into_iter()
                    .map(|f| FilePayload::decode(Bytes::from(f)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Files(files))
            }
            Command::Error => Ok(Self::Error(bincode::deserialize(&payload)?)),
            other => Err(SyncError::Protocol(format!(
                "expected a response, got {:?}",
                other
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_payload_layout() {
        let file = FilePayload::new("docs/a.txt", &b"hello"[..]);
        let encoded = file.encode().unwrap();

        let header_len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(&encoded[4 + header_len..], b"hello");

        let decoded = FilePayload::decode(encoded).unwrap();
        assert_eq!(decoded.header.name, "a.txt");
        assert_eq!(decoded.header.relative_path, "docs/a.txt");
        assert_eq!(decoded.data.as_ref(), b"hello");
    }

    #[test]
    fn test_encoded_lengths_match() {
        let file = FilePayload::new("dir/name.bin", vec![3u8; 1000]);
        assert_eq!(file.encoded_len().unwrap(), file.encode().unwrap().len());

        let resp = Response::Files(vec![file.clone(), file.clone()]);
        let expected = SEQ_LEN_PREFIX + 2 * (SEQ_LEN_PREFIX + file.encoded_len().unwrap());
        assert_eq!(resp.encode().unwrap().len(), expected);
    }

    #[test]
    fn test_file_payload_truncated_header() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_slice(b"short");
        assert!(matches!(
            FilePayload::decode(buf.freeze()),
            Err(SyncError::Protocol(_))
        ));
        assert!(FilePayload::decode(Bytes::from_static(b"ab")).is_err());
    }

    #[test]
    fn test_sync_request_roundtrip() {
        let hashes: BTreeSet<_> = [b"one".as_slice(), b"two".as_slice()]
            .iter()
            .map(|d| ContentHash::from_bytes(d))
            .collect();
        let req = Request::SyncRequest(hashes.clone());
        let decoded = Request::decode(req.command(), req.encode().unwrap()).unwrap();
        assert_eq!(decoded, Request::SyncRequest(hashes));
    }

    #[test]
    fn test_sync_check_rejects_wrong_marker() {
        let body: Bytes = bincode::serialize("chekc").unwrap().into();
        assert!(Request::decode(Command::SyncCheck, body).is_err());
    }

    #[test]
    fn test_files_response_roundtrip() {
        let resp = Response::Files(vec![
            FilePayload::new("a.txt", &b"alpha"[..]),
            FilePayload::new("nested/b.bin", vec![0u8, 1, 2, 255]),
        ]);
        let decoded = Response::decode(resp.command(), resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_request_and_response_commands_are_distinct() {
        assert!(Request::decode(Command::Ack, Bytes::new()).is_err());
        assert!(Response::decode(Command::PushFile, Bytes::new()).is_err());
        assert!(Command::SyncRequest.is_request());
        assert!(!Command::Files.is_request());
    }

    #[test]
    fn test_command_from_u8() {
        assert_eq!(Command::from_u8(0x01), Some(Command::PushFile));
        assert_eq!(Command::from_u8(0x11), Some(Command::Announce));
        assert_eq!(Command::from_u8(0x1F), Some(Command::Error));
        assert_eq!(Command::from_u8(0xFF), None);
    }
}
