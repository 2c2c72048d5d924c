//! The Reflex handshake: authentication, anti-replay, key agreement, and
//! the HTTP-shaped cover replies.
//!
//! A magic-form handshake packet looks like this on the wire (network byte
//! order throughout):
//!
//! ```text
//! magic(4) | client_pubkey(32) | user_uuid(16) | timestamp_i64(8)
//!          | nonce(16) | policy_req_len_u16(2) | policy_req[len]
//! ```
//!
//! Every reply the server sends, success or failure, parses as plausible
//! HTTP, so an active probe sees a web server that happens to 403.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::crypto::{derive_session_key, EphemeralSecret, PublicKey};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::morphing;
use crate::peek::PeekableReader;
use crate::server::{session_loop, Handler};
use crate::session::Session;
use crate::{MAGIC_BYTES, MAX_HANDSHAKE_SIZE};

/// Handshakes whose timestamp is further than this from server time are
/// rejected, bounding how long a captured handshake stays replayable.
pub const TIMESTAMP_WINDOW_SECS: i64 = 300;

/// Decoded client handshake packet.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    /// Client's ephemeral X25519 public key.
    pub public_key: [u8; 32],
    /// Claimed user identity.
    pub user_id: Uuid,
    /// Client clock, unix seconds.
    pub timestamp: i64,
    /// Reserved for a future server-side seen-set; read but not consulted.
    pub nonce: [u8; 16],
    /// Opaque policy request blob, bounded by [`MAX_HANDSHAKE_SIZE`].
    pub policy_req: Vec<u8>,
}

impl ClientHandshake {
    /// Read a magic-form handshake, consuming the already-peeked magic.
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;
        if magic != MAGIC_BYTES {
            return Err(Error::handshake("magic mismatch"));
        }

        let mut public_key = [0u8; 32];
        reader.read_exact(&mut public_key).await?;

        let mut user_id = [0u8; 16];
        reader.read_exact(&mut user_id).await?;

        let timestamp = reader.read_i64().await?;

        let mut nonce = [0u8; 16];
        reader.read_exact(&mut nonce).await?;

        let policy_req_len = reader.read_u16().await? as usize;

        // An adversarial length is skipped rather than read; nothing past
        // the handshake bound is trusted
        let policy_req = if policy_req_len > 0 && policy_req_len < MAX_HANDSHAKE_SIZE {
            let mut blob = vec![0u8; policy_req_len];
            reader.read_exact(&mut blob).await?;
            blob
        } else {
            Vec::new()
        };

        Ok(Self {
            public_key,
            user_id: Uuid::from_bytes(user_id),
            timestamp,
            nonce,
            policy_req,
        })
    }

    /// Encode into wire form, the exact inverse of [`read`].
    ///
    /// [`read`]: Self::read
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(78 + self.policy_req.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_slice(&self.public_key);
        buf.put_slice(self.user_id.as_bytes());
        buf.put_i64(self.timestamp);
        buf.put_slice(&self.nonce);
        buf.put_u16(self.policy_req.len() as u16);
        buf.put_slice(&self.policy_req);
        buf.to_vec()
    }
}

/// HTTP 200 reply carrying the server's public key as an opaque body.
pub fn ok_response(server_public: &PublicKey) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    buf.put_slice(b"Content-Type: application/octet-stream\r\n");
    buf.put_slice(b"Content-Length: 32\r\n");
    buf.put_slice(b"\r\n");
    buf.put_slice(server_public.as_bytes());
    buf.to_vec()
}

/// HTTP 403 cover reply with a JSON error body.
pub fn forbidden_response(error: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\n\r\n{{\"error\":\"{}\"}}",
        error
    )
    .into_bytes()
}

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_secs() as i64),
    }
}

impl Handler {
    /// Run a magic-form handshake, then the session loop.
    pub(crate) async fn handle_magic_handshake<R, W>(
        &self,
        reader: &mut PeekableReader<R>,
        writer: &mut W,
        dispatcher: &dyn Dispatcher,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let budget = self.default_policy().timeouts.handshake;
        let hs = match tokio::time::timeout(budget, ClientHandshake::read(reader)).await {
            Ok(Ok(hs)) => hs,
            Ok(Err(e)) => {
                self.metrics().record_handshake_error();
                return Err(e);
            }
            Err(_) => {
                self.metrics().record_handshake_error();
                return Err(Error::Timeout(budget.as_millis() as u64));
            }
        };

        let Some(user) = self.user_by_id(&hs.user_id) else {
            self.metrics().record_auth_failure();
            tracing::debug!("handshake from unknown user {}", hs.user_id);
            writer
                .write_all(&forbidden_response("authentication failed"))
                .await?;
            return Err(Error::Authentication);
        };

        let now = unix_now();
        if (now - hs.timestamp).abs() > TIMESTAMP_WINDOW_SECS {
            self.metrics().record_handshake_error();
            tracing::debug!(
                user = %user.email,
                skew = now - hs.timestamp,
                "handshake timestamp outside window"
            );
            writer
                .write_all(&forbidden_response("invalid timestamp"))
                .await?;
            return Err(Error::handshake("timestamp out of range"));
        }

        // Fresh keypair per handshake: every session gets forward secrecy
        let server_secret = EphemeralSecret::random();
        let server_public = PublicKey::from(&server_secret);
        let shared = server_secret.diffie_hellman(&PublicKey::from_bytes(hs.public_key));
        let session_key = derive_session_key(&shared);

        writer.write_all(&ok_response(&server_public)).await?;

        let mut session = Session::with_key(session_key);
        if let Some(profile) = user
            .policy
            .as_deref()
            .and_then(morphing::by_name)
        {
            tracing::debug!(user = %user.email, profile = profile.name(), "morphing enabled");
            session.set_profile(profile);
        }

        self.metrics().record_authenticated();
        let policy = self.policy_for(user);
        session_loop::run(session, user, reader, writer, dispatcher, policy).await
    }
}
