//! Session layer: AEAD-encrypted frame codec with monotonic nonces.
//!
//! A [`Session`] owns the cipher state for one connection. Read and write
//! directions keep independent frame counters, each behind its own lock, so
//! the two pump tasks of a connection never contend with each other. Replay
//! resistance falls out of the counter discipline: a replayed ciphertext
//! fails to open because the reader counter has moved on.

mod frame;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PLAINTEXT_SIZE};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Aead, AeadKey, Nonce, TAG_SIZE};
use crate::error::{Error, Result};
use crate::morphing::TrafficProfile;
use crate::MAX_FRAME_SIZE;

/// Encryption and framing state for one Reflex connection.
pub struct Session {
    aead: Aead,
    read_nonce: Mutex<u64>,
    write_nonce: Mutex<u64>,
    profile: Option<TrafficProfile>,
    morphing_enabled: bool,
}

impl Session {
    /// Create a session from a 32-byte key.
    pub fn new(session_key: &[u8]) -> Result<Self> {
        let key = AeadKey::from_slice(session_key)?;
        Ok(Self::with_key(key))
    }

    /// Create a session from an already-validated key.
    pub fn with_key(key: AeadKey) -> Self {
        Self {
            aead: Aead::new(&key),
            read_nonce: Mutex::new(0),
            write_nonce: Mutex::new(0),
            profile: None,
            morphing_enabled: false,
        }
    }

    /// Attach a traffic profile and enable egress morphing.
    pub fn set_profile(&mut self, profile: TrafficProfile) {
        self.profile = Some(profile);
        self.morphing_enabled = true;
    }

    /// The session's traffic profile, if morphing was negotiated.
    pub fn profile(&self) -> Option<&TrafficProfile> {
        self.profile.as_ref()
    }

    /// Whether DATA written to the client should pass through the
    /// morphing writer.
    pub fn morphing_enabled(&self) -> bool {
        self.morphing_enabled
    }

    /// Frames read so far.
    pub fn read_counter(&self) -> u64 {
        *self.read_nonce.lock()
    }

    /// Frames written so far.
    pub fn write_counter(&self) -> u64 {
        *self.write_nonce.lock()
    }

    /// Take the next read-nonce value, advancing the counter.
    fn next_read_nonce(&self) -> Nonce {
        let mut guard = self.read_nonce.lock();
        let counter = *guard;
        *guard += 1;
        Nonce::from_counter(counter)
    }

    /// Take the next write-nonce value, advancing the counter.
    pub(crate) fn next_write_nonce(&self) -> Nonce {
        let mut guard = self.write_nonce.lock();
        let counter = *guard;
        *guard += 1;
        Nonce::from_counter(counter)
    }

    pub(crate) fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.aead.decrypt(nonce, ciphertext, b"")
    }

    pub(crate) fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.aead.encrypt(nonce, plaintext, b"")
    }

    /// Read and decrypt one frame.
    ///
    /// Returns `Ok(None)` on a clean close at a frame boundary. The type
    /// byte is validated before the ciphertext is read, so garbage headers
    /// are rejected without touching the cipher.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::invalid("truncated frame header"));
            }
            filled += n;
        }

        let length = u16::from_be_bytes([header[0], header[1]]) as usize;
        let frame_type = FrameType::from_u8(header[2])?;

        let mut ciphertext = vec![0u8; length];
        reader.read_exact(&mut ciphertext).await?;

        let nonce = self.next_read_nonce();
        let payload = self.open(&nonce, &ciphertext)?;

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    /// Encrypt and write one frame.
    pub async fn write_frame<W>(
        &self,
        writer: &mut W,
        frame_type: FrameType,
        plaintext: &[u8],
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(Error::FrameTooLarge(plaintext.len() + TAG_SIZE));
        }

        let nonce = self.next_write_nonce();
        let ciphertext = self.seal(&nonce, plaintext)?;
        debug_assert!(ciphertext.len() <= MAX_FRAME_SIZE);

        let mut wire = Vec::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
        wire.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        wire.push(frame_type as u8);
        wire.extend_from_slice(&ciphertext);

        writer.write_all(&wire).await?;
        Ok(())
    }
}
