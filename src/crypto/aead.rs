//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses ChaCha20-Poly1305 for symmetric encryption with authentication.
//! This cipher is fast in software, constant-time, and widely deployed
//! (TLS 1.3, WireGuard), so its ciphertexts blend into the background.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, validating the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care, this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// A nonce (number used once) for AEAD operations.
///
/// Frame nonces are counter-based: the first 4 bytes are zero and the last
/// 8 carry the per-direction frame counter in big-endian. Each direction
/// maintains its own strictly monotonic counter, so a (direction, counter)
/// pair is never reused under one key.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Build a nonce from a 64-bit direction counter.
    pub fn from_counter(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..12].copy_from_slice(&counter.to_be_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Get the counter value carried by this nonce.
    pub fn counter(&self) -> u64 {
        u64::from_be_bytes(self.0[4..12].try_into().unwrap())
    }
}

impl From<u64> for Nonce {
    fn from(counter: u64) -> Self {
        Self::from_counter(counter)
    }
}

/// ChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext, returning ciphertext with the 16-byte tag appended.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext, verifying the appended tag.
    ///
    /// # Errors
    ///
    /// Fails on wrong key, wrong nonce (including replayed frames, since the
    /// reader counter has advanced), or tampered data.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::invalid(format!(
                "ciphertext shorter than tag: {} bytes",
                ciphertext.len()
            )));
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}
