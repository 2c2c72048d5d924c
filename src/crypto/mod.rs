//! Cryptographic primitives for the Reflex handshake and session layer.
//!
//! This module provides:
//! - X25519 Elliptic Curve Diffie-Hellman key exchange
//! - ChaCha20-Poly1305 AEAD encryption
//! - HKDF-SHA256 session-key derivation
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod kdf;
mod keys;
mod random;

pub use aead::{Aead, AeadKey, Nonce};
pub use kdf::derive_session_key;
pub use keys::{EphemeralSecret, PublicKey, SharedSecret};
pub use random::{random_padding, SecureRandom};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of X25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
