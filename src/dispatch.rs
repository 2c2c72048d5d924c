//! Upstream dispatch: the seam between the protocol engine and the
//! outbound world.
//!
//! The session loop never resolves names or dials targets itself. It hands
//! a [`Destination`] to a [`Dispatcher`] and gets back a [`Link`], a pair of
//! byte pipes to an already-connected upstream. The surrounding process can
//! plug in routing, DNS policy, or chained outbounds behind this trait; the
//! engine ships a plain TCP implementation.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::destination::Destination;
use crate::error::{Error, Result};

/// A bidirectional byte pipe to a connected upstream target.
pub struct Link {
    /// Bytes flowing from the upstream back to the client.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes flowing from the client to the upstream.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Resolves and connects destinations on behalf of sessions.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Open a link to `destination`.
    async fn dispatch(&self, destination: &Destination) -> Result<Link>;
}

/// Dispatcher that dials targets directly over TCP.
#[derive(Debug, Default)]
pub struct DirectDispatcher;

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, destination: &Destination) -> Result<Link> {
        let stream = TcpStream::connect((destination.host(), destination.port))
            .await
            .map_err(|e| Error::dispatch(format!("{}: {}", destination, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = tokio::io::split(stream);
        Ok(Link {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}
