//! X25519 key exchange primitives.
//!
//! Provides type-safe wrappers around X25519 operations. Private-key
//! clamping is handled by the underlying scalar arithmetic, so callers
//! never see raw unclamped scalars.

use x25519_dalek::{
    EphemeralSecret as DalekEphemeral, PublicKey as DalekPublic, SharedSecret as DalekShared,
};

use crate::crypto::PUBLIC_KEY_SIZE;

/// An ephemeral (single-use) X25519 secret key.
///
/// The server generates one per handshake, which gives every session
/// forward secrecy. Consumed by the Diffie-Hellman computation.
pub struct EphemeralSecret(DalekEphemeral);

impl EphemeralSecret {
    /// Generate a new random ephemeral secret.
    pub fn random() -> Self {
        Self(DalekEphemeral::random_from_rng(rand::thread_rng()))
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn diffie_hellman(self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret(self.0.diffie_hellman(&their_public.0))
    }
}

impl From<&EphemeralSecret> for PublicKey {
    fn from(secret: &EphemeralSecret) -> Self {
        PublicKey(DalekPublic::from(&secret.0))
    }
}

/// An X25519 public key.
///
/// Safe to share publicly. The client's arrives in the handshake packet;
/// the server's goes back in the HTTP-shaped reply body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(DalekPublic);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(DalekPublic::from(bytes))
    }

    /// Get the raw bytes of this public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Convert to raw bytes.
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// The result of an X25519 Diffie-Hellman key exchange.
///
/// Must be fed through the KDF before use as a key; zeroized on drop by
/// the underlying implementation.
pub struct SharedSecret(DalekShared);

impl SharedSecret {
    /// Get the raw shared secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}
