//! Payload obfuscation.
//!
//! Frames are run through a symmetric, self-inverse transform keyed by the
//! shared secret. The default keystream is a BLAKE3 XOF seeded from the key;
//! it hides payloads from casual inspection but offers no integrity or
//! authentication.

/// Domain separation context for keystream derivation
const KEYSTREAM_CONTEXT: &str = "hashsync 2026-10 frame keystream";

/// A self-inverse transform: `transform(transform(x, k), k) == x`.
pub trait Cipher: Send + Sync {
    fn transform(&self, data: &[u8], key: &[u8]) -> Vec<u8>;
}

/// XOR against a BLAKE3 extendable-output keystream.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeystreamCipher;

impl Cipher for KeystreamCipher {
    fn transform(&self, data: &[u8], key: &[u8]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new_derive_key(KEYSTREAM_CONTEXT);
        hasher.update(key);
        let mut keystream = hasher.finalize_xof();

        let mut out = data.to_vec();
        let mut block = [0u8; 64];
        for chunk in out.chunks_mut(block.len()) {
            keystream.fill(&mut block[..chunk.len()]);
            for (byte, k) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= k;
            }
        }
        out
    }
}
