//! Inbound handler: user registry, connection demultiplexer, and the
//! public `process` entry point.
//!
//! Every accepted connection flows through [`Handler::process`]. The
//! handler peeks at the first 64 bytes and routes:
//!
//! 1. `RFXL` magic → Reflex handshake, then the session loop
//! 2. `POST` + `HTTP/` within the peek window → HTTP-wrapped handshake
//!    (recognized so it is not mistaken for cover traffic; currently
//!    serviced by the fallback splicer)
//! 3. anything else, or a failed peek → fallback splicer
//!
//! The handler itself is immutable after construction and shared across
//! all connections.

mod fallback;
mod handshake;
mod metrics;
mod session_loop;

pub use handshake::{forbidden_response, ok_response, ClientHandshake, TIMESTAMP_WINDOW_SECS};
pub use metrics::HandlerMetrics;

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::config::InboundConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::peek::PeekableReader;
use crate::policy::{Policy, PolicyManager};
use crate::{MAGIC_BYTES, MIN_HANDSHAKE_SIZE};

/// Networks a handler can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Plain TCP byte streams (QUIC streams are fed through the same path).
    Tcp,
}

/// An authorized user, immutable after handler construction.
#[derive(Debug, Clone)]
pub struct User {
    /// Canonical UUID.
    pub id: Uuid,
    /// Display identity; the canonical UUID string.
    pub email: String,
    /// Level indexing the timeout policy.
    pub level: u32,
    /// Traffic-profile name, when morphing is granted.
    pub policy: Option<String>,
}

/// Cover-server settings resolved from config.
#[derive(Debug, Clone, Copy)]
struct FallbackServer {
    dest_port: u16,
}

/// The inbound protocol engine.
pub struct Handler {
    users: Vec<User>,
    users_by_id: HashMap<Uuid, usize>,
    fallback: Option<FallbackServer>,
    policy_manager: PolicyManager,
    metrics: HandlerMetrics,
}

impl Handler {
    /// Build a handler from validated configuration.
    ///
    /// Fails on the first malformed client UUID; a handler never serves a
    /// partially-parsed user list.
    pub fn new(config: InboundConfig) -> Result<Self> {
        let mut users = Vec::with_capacity(config.clients.len());
        let mut users_by_id = HashMap::with_capacity(config.clients.len());

        for client in &config.clients {
            let id = client.parse_id()?;
            if users_by_id.contains_key(&id) {
                return Err(Error::config(format!("duplicate client UUID {}", id)));
            }

            let policy = client
                .policy
                .as_deref()
                .filter(|name| !name.is_empty())
                .map(str::to_owned);

            users_by_id.insert(id, users.len());
            users.push(User {
                id,
                email: id.to_string(),
                level: client.level,
                policy,
            });
        }

        Ok(Self {
            users,
            users_by_id,
            fallback: config
                .fallback
                .map(|f| FallbackServer { dest_port: f.dest }),
            policy_manager: PolicyManager::new(),
            metrics: HandlerMetrics::new(),
        })
    }

    /// Networks this handler accepts.
    pub fn networks(&self) -> &'static [Network] {
        &[Network::Tcp]
    }

    /// Authorized users, in configuration order.
    pub fn users(&self) -> &[User] {
        &self.users
    }

    /// Aggregate counters for this handler.
    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    pub(crate) fn user_by_id(&self, id: &Uuid) -> Option<&User> {
        self.users_by_id.get(id).map(|&idx| &self.users[idx])
    }

    pub(crate) fn policy_for(&self, user: &User) -> Policy {
        self.policy_manager.for_level(user.level)
    }

    /// Policy used before a user is known (handshake reads, fallback).
    pub(crate) fn default_policy(&self) -> Policy {
        self.policy_manager.for_level(0)
    }

    /// Serve one accepted connection to completion.
    ///
    /// Generic over the byte stream so TCP connections, QUIC streams, and
    /// in-memory test pipes all take the same path.
    pub async fn process<S>(&self, stream: S, dispatcher: &dyn Dispatcher) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.metrics.record_connection();

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = PeekableReader::new(read_half);

        let head = match reader.peek(MIN_HANDSHAKE_SIZE).await {
            Ok(peeked) => {
                let mut head = [0u8; MIN_HANDSHAKE_SIZE];
                head.copy_from_slice(peeked);
                head
            }
            Err(e) => {
                // Too short to be a handshake; still worth covering for
                if self.fallback.is_some() {
                    return self.handle_fallback(&mut reader, &mut write_half).await;
                }
                return Err(e.into());
            }
        };

        if head[..4] == MAGIC_BYTES {
            return self
                .handle_magic_handshake(&mut reader, &mut write_half, dispatcher)
                .await;
        }

        if is_http_post_like(&head) {
            return self
                .handle_http_handshake(&mut reader, &mut write_half, dispatcher)
                .await;
        }

        self.handle_fallback(&mut reader, &mut write_half).await
    }

    /// HTTP-wrapped handshake form: detected but not parsed; serviced by
    /// the fallback splicer so probes see an ordinary web server.
    async fn handle_http_handshake<R, W>(
        &self,
        reader: &mut PeekableReader<R>,
        writer: &mut W,
        _dispatcher: &dyn Dispatcher,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.handle_fallback(reader, writer).await
    }

    async fn handle_fallback<R, W>(
        &self,
        reader: &mut PeekableReader<R>,
        writer: &mut W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let Some(fallback) = self.fallback else {
            return Err(Error::NoFallback);
        };

        self.metrics.record_fallback();
        fallback::splice(fallback.dest_port, reader, writer, self.default_policy()).await
    }
}

/// True when the peeked bytes look like an HTTP POST request: `POST` at the
/// start and `HTTP/` somewhere in the first 64 bytes.
fn is_http_post_like(data: &[u8]) -> bool {
    if data.len() < 4 || &data[..4] != b"POST" {
        return false;
    }

    let window = &data[..data.len().min(64)];
    window.windows(5).any(|w| w == b"HTTP/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, FallbackConfig};
    use crate::crypto::{derive_session_key, EphemeralSecret, PublicKey};
    use crate::destination::{Address, Destination};
    use crate::dispatch::{DirectDispatcher, Link};
    use crate::session::{FrameType, Session};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    const TEST_UUID: &str = "10000000-2000-4000-8000-000000000003";

    fn test_config(fallback: Option<u16>) -> InboundConfig {
        InboundConfig {
            clients: vec![ClientConfig {
                id: TEST_UUID.into(),
                policy: None,
                level: 0,
            }],
            fallback: fallback.map(|dest| FallbackConfig { dest }),
        }
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn handshake_bytes(user_id: Uuid, public_key: [u8; 32], timestamp: i64) -> Vec<u8> {
        ClientHandshake {
            public_key,
            user_id,
            timestamp,
            nonce: crate::crypto::SecureRandom::bytes(),
            policy_req: Vec::new(),
        }
        .encode()
    }

    /// Read one HTTP response: headers plus a 32-byte body for 200s.
    async fn read_http_response(conn: &mut DuplexStream) -> Vec<u8> {
        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before response completed");
            response.extend_from_slice(&buf[..n]);

            if let Some(pos) = response.windows(4).position(|w| w == b"\r\n\r\n") {
                if response.starts_with(b"HTTP/1.1 200") {
                    if response.len() >= pos + 4 + 32 {
                        return response;
                    }
                } else {
                    return response;
                }
            }
        }
    }

    struct StubDispatcher {
        link: Mutex<Option<DuplexStream>>,
        seen: Mutex<Option<Destination>>,
    }

    impl StubDispatcher {
        fn new(upstream: DuplexStream) -> Self {
            Self {
                link: Mutex::new(Some(upstream)),
                seen: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Dispatcher for StubDispatcher {
        async fn dispatch(&self, destination: &Destination) -> Result<Link> {
            *self.seen.lock() = Some(destination.clone());
            let stream = self.link.lock().take().expect("single dispatch");
            let (reader, writer) = tokio::io::split(stream);
            Ok(Link {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })
        }
    }

    #[test]
    fn test_handler_construction() {
        let handler = Handler::new(test_config(Some(8080))).unwrap();
        assert_eq!(handler.users().len(), 1);
        assert_eq!(handler.users()[0].email, TEST_UUID);
        assert_eq!(handler.networks(), &[Network::Tcp]);

        let id = Uuid::parse_str(TEST_UUID).unwrap();
        assert!(handler.user_by_id(&id).is_some());
        assert!(handler.user_by_id(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_handler_canonicalizes_uuid_case() {
        let mut config = test_config(None);
        config.clients[0].id = TEST_UUID.to_uppercase();

        let handler = Handler::new(config).unwrap();
        let id = Uuid::parse_str(TEST_UUID).unwrap();
        assert_eq!(handler.user_by_id(&id).unwrap().email, TEST_UUID);
    }

    #[test]
    fn test_handler_rejects_bad_config() {
        let mut config = test_config(None);
        config.clients[0].id = "garbage".into();
        assert!(Handler::new(config).is_err());

        let mut config = test_config(None);
        config.clients.push(config.clients[0].clone());
        assert!(matches!(Handler::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_policy_name_is_dropped() {
        let mut config = test_config(None);
        config.clients[0].policy = Some(String::new());

        let handler = Handler::new(config).unwrap();
        assert!(handler.users()[0].policy.is_none());
    }

    #[test]
    fn test_http_post_classifier() {
        assert!(is_http_post_like(b"POST /api/v1 HTTP/1.1\r\nHost: x\r\n"));
        assert!(!is_http_post_like(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(!is_http_post_like(b"POST only, no version marker here"));
        assert!(!is_http_post_like(b"POS"));
    }

    // Scenario: handshake happy path
    #[tokio::test]
    async fn test_handshake_happy_path() {
        let handler = Arc::new(Handler::new(test_config(None)).unwrap());
        let (mut client, server_io) = tokio::io::duplex(16 * 1024);

        let server_handler = Arc::clone(&handler);
        let server = tokio::spawn(async move {
            server_handler.process(server_io, &DirectDispatcher).await
        });

        let client_secret = EphemeralSecret::random();
        let client_public = PublicKey::from(&client_secret);
        let wire = handshake_bytes(
            Uuid::parse_str(TEST_UUID).unwrap(),
            client_public.to_bytes(),
            unix_now(),
        );
        client.write_all(&wire).await.unwrap();

        let response = read_http_response(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        assert!(response.len() >= 32);

        // Clean close: the session loop sees EOF before any DATA frame
        drop(client);
        server.await.unwrap().unwrap();
        assert_eq!(handler.metrics().authenticated_sessions(), 1);
    }

    // Scenario: expired timestamp
    #[tokio::test]
    async fn test_handshake_bad_timestamp() {
        let handler = Arc::new(Handler::new(test_config(None)).unwrap());
        let (mut client, server_io) = tokio::io::duplex(16 * 1024);

        let server_handler = Arc::clone(&handler);
        let server = tokio::spawn(async move {
            server_handler.process(server_io, &DirectDispatcher).await
        });

        let wire = handshake_bytes(
            Uuid::parse_str(TEST_UUID).unwrap(),
            [0x42; 32],
            unix_now() - 601,
        );
        client.write_all(&wire).await.unwrap();

        let response = read_http_response(&mut client).await;
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("403 Forbidden"));
        assert!(text.contains("invalid timestamp"));

        let result = server.await.unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(handler.metrics().handshake_errors(), 1);
    }

    // Scenario: unknown user
    #[tokio::test]
    async fn test_handshake_unknown_user() {
        let handler = Arc::new(Handler::new(test_config(None)).unwrap());
        let (mut client, server_io) = tokio::io::duplex(16 * 1024);

        let server_handler = Arc::clone(&handler);
        let server = tokio::spawn(async move {
            server_handler.process(server_io, &DirectDispatcher).await
        });

        let wire = handshake_bytes(Uuid::new_v4(), [0x42; 32], unix_now());
        client.write_all(&wire).await.unwrap();

        let response = read_http_response(&mut client).await;
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("403 Forbidden"));
        assert!(text.contains("authentication failed"));

        let result = server.await.unwrap();
        assert!(matches!(result, Err(Error::Authentication)));
        assert_eq!(handler.metrics().auth_failures(), 1);
    }

    // Scenario: fallback transparency
    #[tokio::test]
    async fn test_fallback_transparency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cover = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request.ends_with(b"\r\n\r\n") {
                    break;
                }
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
                .await
                .unwrap();
            request
        });

        let handler = Arc::new(Handler::new(test_config(Some(port))).unwrap());
        let (mut client, server_io) = tokio::io::duplex(16 * 1024);

        let server_handler = Arc::clone(&handler);
        let server = tokio::spawn(async move {
            server_handler.process(server_io, &DirectDispatcher).await
        });

        let request =
            b"GET / HTTP/1.1\r\nHost: x\r\nUser-Agent: curl/8.5.0\r\nAccept: */*\r\n\r\n";
        client.write_all(request).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.ends_with(b"OK") {
                break;
            }
        }
        drop(client);

        // The cover server received the client bytes exactly, from offset 0
        assert_eq!(cover.await.unwrap(), request);
        assert!(String::from_utf8(response).unwrap().ends_with("OK"));

        server.await.unwrap().unwrap();
        assert_eq!(handler.metrics().fallback_connections(), 1);
    }

    #[tokio::test]
    async fn test_short_connection_without_fallback_errors() {
        let handler = Handler::new(test_config(None)).unwrap();
        let (mut client, server_io) = tokio::io::duplex(256);

        client.write_all(b"hi").await.unwrap();
        drop(client);

        let result = handler.process(server_io, &DirectDispatcher).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_non_reflex_without_fallback_errors() {
        let handler = Handler::new(test_config(None)).unwrap();
        let (mut client, server_io) = tokio::io::duplex(4096);

        client
            .write_all(&[0x55; MIN_HANDSHAKE_SIZE + 16])
            .await
            .unwrap();

        let result = handler.process(server_io, &DirectDispatcher).await;
        assert!(matches!(result, Err(Error::NoFallback)));
    }

    // Scenario: full session with first-frame destination
    #[tokio::test]
    async fn test_end_to_end_session() {
        let handler = Arc::new(Handler::new(test_config(None)).unwrap());
        let (mut client, server_io) = tokio::io::duplex(64 * 1024);
        let (upstream_local, upstream_remote) = tokio::io::duplex(64 * 1024);

        let dispatcher = Arc::new(StubDispatcher::new(upstream_local));
        let server_handler = Arc::clone(&handler);
        let server_dispatcher = Arc::clone(&dispatcher);
        let server = tokio::spawn(async move {
            server_handler
                .process(server_io, server_dispatcher.as_ref())
                .await
        });

        // Handshake
        let client_secret = EphemeralSecret::random();
        let client_public = PublicKey::from(&client_secret);
        let wire = handshake_bytes(
            Uuid::parse_str(TEST_UUID).unwrap(),
            client_public.to_bytes(),
            unix_now(),
        );
        client.write_all(&wire).await.unwrap();

        let response = read_http_response(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));

        // Derive the same session key from the server's public key body
        let body_start = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let server_public: [u8; 32] = response[body_start..body_start + 32].try_into().unwrap();
        let shared = client_secret.diffie_hellman(&PublicKey::from_bytes(server_public));
        let session = Session::with_key(derive_session_key(&shared));

        // First DATA frame: destination 127.0.0.1:80 + inline "Hi"
        let mut first = Destination {
            address: Address::Ip("127.0.0.1".parse().unwrap()),
            port: 80,
        }
        .encode();
        first.extend_from_slice(b"Hi");
        session
            .write_frame(&mut client, FrameType::Data, &first)
            .await
            .unwrap();

        let (mut up_reader, mut up_writer) = tokio::io::split(upstream_remote);
        let mut got = [0u8; 2];
        up_reader.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"Hi");

        // Upstream response comes back framed
        up_writer.write_all(b"answer").await.unwrap();
        let frame = session.read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.payload, b"answer");

        // Shut down
        session
            .write_frame(&mut client, FrameType::Close, b"")
            .await
            .unwrap();
        drop(up_writer);

        server.await.unwrap().unwrap();
        assert_eq!(
            dispatcher.seen.lock().clone().unwrap().to_string(),
            "127.0.0.1:80"
        );
    }

    // Morphing: a client whose policy names a profile gets shaped frames
    #[tokio::test]
    async fn test_morphing_profile_applied_from_policy() {
        let mut config = test_config(None);
        config.clients[0].policy = Some("zoom".into());

        let handler = Arc::new(Handler::new(config).unwrap());
        let (mut client, server_io) = tokio::io::duplex(256 * 1024);
        let (upstream_local, upstream_remote) = tokio::io::duplex(64 * 1024);

        let dispatcher = Arc::new(StubDispatcher::new(upstream_local));
        let server_handler = Arc::clone(&handler);
        let server_dispatcher = Arc::clone(&dispatcher);
        let server = tokio::spawn(async move {
            server_handler
                .process(server_io, server_dispatcher.as_ref())
                .await
        });

        let client_secret = EphemeralSecret::random();
        let client_public = PublicKey::from(&client_secret);
        let wire = handshake_bytes(
            Uuid::parse_str(TEST_UUID).unwrap(),
            client_public.to_bytes(),
            unix_now(),
        );
        client.write_all(&wire).await.unwrap();

        let response = read_http_response(&mut client).await;
        let body_start = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let server_public: [u8; 32] = response[body_start..body_start + 32].try_into().unwrap();
        let shared = client_secret.diffie_hellman(&PublicKey::from_bytes(server_public));
        let session = Session::with_key(derive_session_key(&shared));

        let mut first = Destination {
            address: Address::Ip("127.0.0.1".parse().unwrap()),
            port: 80,
        }
        .encode();
        first.extend_from_slice(b"req");
        session
            .write_frame(&mut client, FrameType::Data, &first)
            .await
            .unwrap();

        let (mut up_reader, mut up_writer) = tokio::io::split(upstream_remote);
        let mut got = [0u8; 3];
        up_reader.read_exact(&mut got).await.unwrap();

        // Zoom profile sizes are 500/600/700: a short reply gets padded up
        up_writer.write_all(b"tiny").await.unwrap();
        let frame = session.read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Data);
        assert!([500, 600, 700].contains(&frame.payload.len()));
        assert_eq!(&frame.payload[..4], b"tiny");

        session
            .write_frame(&mut client, FrameType::Close, b"")
            .await
            .unwrap();
        drop(up_writer);
        server.await.unwrap().unwrap();
    }
}
