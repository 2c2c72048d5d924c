//! # Reflex
//!
//! Server-side core of an obfuscated transport protocol designed to evade
//! passive and active censorship. A client performs a handshake that is
//! wire-indistinguishable from plausible HTTP traffic, derives a session key,
//! and then exchanges AEAD-encrypted frames that may be padded and timed to
//! mimic known application traffic. Anything else arriving on the listening
//! port is transparently forwarded to a cover web server.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Inbound Handler                        │
//! │          peek(64) → magic / HTTP POST / other              │
//! ├──────────────────┬──────────────────┬─────────────────────┤
//! │  Handshake       │  HTTP-wrapped    │  Fallback Splicer   │
//! │  (X25519 + HKDF, │  (detected,      │  (byte-faithful     │
//! │   UUID auth)     │   → fallback)    │   cover proxy)      │
//! ├──────────────────┴──────────────────┴─────────────────────┤
//! │   Session Loop (frame dispatch, bidirectional pump)        │
//! ├───────────────────────────────────────────────────────────┤
//! │   Frame Codec (ChaCha20-Poly1305, monotonic nonces)        │
//! │   Traffic Morphing (packet size / delay distributions)     │
//! └───────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod destination;
pub mod dispatch;
pub mod error;
pub mod morphing;
pub mod peek;
pub mod policy;
pub mod server;
pub mod session;

pub use config::{FallbackConfig, InboundConfig, OutboundConfig};
pub use error::{Error, Result};
pub use server::Handler;

/// Magic constant identifying a raw handshake: `"RFXL"` big-endian.
pub const REFLEX_MAGIC: u32 = 0x5246_584C;

/// The magic constant as wire bytes.
pub const MAGIC_BYTES: [u8; 4] = REFLEX_MAGIC.to_be_bytes();

/// Minimum bytes needed to classify an incoming connection.
pub const MIN_HANDSHAKE_SIZE: usize = 64;

/// Maximum size of a handshake packet, bounding the policy-request blob.
pub const MAX_HANDSHAKE_SIZE: usize = 1024;

/// Maximum ciphertext length of a single frame.
pub const MAX_FRAME_SIZE: usize = 65535;
