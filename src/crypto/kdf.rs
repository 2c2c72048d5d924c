//! Session-key derivation.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256 to turn the
//! X25519 shared secret into the 32-byte AEAD session key.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::{AeadKey, SharedSecret, KEY_SIZE};

/// Domain-separation label for the session KDF, used as both salt and info.
const SESSION_CONTEXT: &[u8] = b"reflex-session";

/// Derive the AEAD session key from a Diffie-Hellman shared secret.
///
/// Both peers run the same derivation, so a single key covers both
/// directions; nonce discipline keeps the directions from colliding.
pub fn derive_session_key(shared: &SharedSecret) -> AeadKey {
    let hkdf = Hkdf::<Sha256>::new(Some(SESSION_CONTEXT), shared.as_bytes());

    let mut okm = [0u8; KEY_SIZE];
    // Output length is a valid SHA-256 expansion, so this cannot fail
    hkdf.expand(SESSION_CONTEXT, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    AeadKey::from_bytes(okm)
}
