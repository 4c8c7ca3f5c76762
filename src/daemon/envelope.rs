//! Symmetric encryption envelope for frame payloads.
//!
//! The 32-byte key is provisioned out-of-band (base64-encoded) by whatever
//! launched the daemon; this module never generates or exchanges keys.
//! Ciphertext layout: `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext+tag`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{RelayError, Result};

/// Required decoded key length.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Encrypts every outgoing frame payload and decrypts every incoming one.
///
/// Shared read-only by all sessions.
pub struct Envelope {
    cipher: ChaCha20Poly1305,
}

impl Envelope {
    /// Build the envelope from base64 key material.
    ///
    /// Absent or malformed key material is a fatal startup condition, not a
    /// recoverable fault.
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|_| RelayError::Fatal("pre-shared key is not valid base64".into()))?;

        if key_bytes.len() != KEY_LEN {
            return Err(RelayError::Fatal(format!(
                "pre-shared key must decode to {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
        })
    }

    /// Encrypt one frame payload; the fresh nonce travels as a prefix.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("ChaCha20-Poly1305 encryption should not fail on in-memory buffers");

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt one frame payload.
    ///
    /// Corrupt or tampered input is a recoverable crypto fault that ends
    /// only the offending session, never the process.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            return Err(RelayError::Crypto);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RelayError::Crypto)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
