//! Frame codec: `command:u8 | len:u32 (BE) | enciphered payload`.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::{Cipher, KeystreamCipher};
use crate::error::{Result, SyncError};
use crate::wire::protocol::{Command, Request, Response};

/// Command byte + length
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum frame size (256MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// One decoded frame. `length` is the payload length as transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub length: u32,
    pub payload: Bytes,
}

/// Frames and enciphers messages with a shared key.
#[derive(Clone)]
pub struct FrameCodec {
    cipher: Arc<dyn Cipher>,
    key: Bytes,
    max_frame: u32,
}

impl FrameCodec {
    /// Codec using the default keystream cipher
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self::with_cipher(Arc::new(KeystreamCipher), key)
    }

    pub fn with_cipher(cipher: Arc<dyn Cipher>, key: impl Into<Bytes>) -> Self {
        Self {
            cipher,
            key: key.into(),
            max_frame: MAX_FRAME_SIZE,
        }
    }

    /// Lower the largest payload this codec will send or accept.
    pub fn with_max_frame(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame.min(MAX_FRAME_SIZE);
        self
    }

    pub fn max_frame(&self) -> u32 {
        self.max_frame
    }

    /// Encode a complete frame: header followed by the enciphered payload.
    pub fn encode(&self, command: Command, plaintext: &[u8]) -> Result<Bytes> {
        let ciphered = self.cipher.transform(plaintext, &self.key);
        let size = u32::try_from(ciphered.len()).unwrap_or(u32::MAX);
        if size > self.max_frame {
            return Err(SyncError::FrameTooLarge {
                size,
                max: self.max_frame,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + ciphered.len());
        buf.put_u8(command as u8);
        buf.put_u32(size);
        buf.put_slice(&ciphered);
        Ok(buf.freeze())
    }

    /// Write one frame as a single logical write.
    pub async fn send<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        command: Command,
        plaintext: &[u8],
    ) -> Result<()> {
        let frame = self.encode(command, plaintext)?;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    /// Read exactly one frame, tolerating short reads, and decipher it.
    pub async fn receive<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        read_full(r, &mut header).await?;

        let command = Command::from_u8(header[0]).ok_or(SyncError::UnknownCommand(header[0]))?;
        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);

        // Validate frame size before allocation
        if length > self.max_frame {
            return Err(SyncError::FrameTooLarge {
                size: length,
                max: self.max_frame,
            });
        }

        let mut ciphered = vec![0u8; length as usize];
        read_full(r, &mut ciphered).await?;

        Ok(Frame {
            command,
            length,
            payload: Bytes::from(self.cipher.transform(&ciphered, &self.key)),
        })
    }

    pub async fn send_request<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        req: &Request,
    ) -> Result<()> {
        self.send(w, req.command(), &req.encode()?).await
    }

    pub async fn receive_request<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Request> {
        let frame = self.receive(r).await?;
        Request::decode(frame.command, frame.payload)
    }

    pub async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        resp: &Response,
    ) -> Result<()> {
        self.send(w, resp.command(), &resp.encode()?).await
    }

    pub async fn receive_response<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Response> {
        let frame = self.receive(r).await?;
        Response::decode(frame.command, frame.payload)
    }
}

/// Fill `buf` completely. A stream transport may hand back fewer bytes than
/// asked for, so keep reading; a zero-length read means the peer closed.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(SyncError::ConnectionClosed {
                received: filled,
                expected: buf.len(),
            });
        }
        filled += n;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
