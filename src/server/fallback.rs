//! Fallback splicer: byte-faithful proxy to the cover web server.
//!
//! Connections that do not classify as Reflex are forwarded to a local
//! cover server so an external observer sees a normal website. The splice
//! starts with the bytes the demultiplexer peeked, so the cover server
//! receives the client stream exactly from offset 0 with no rewriting.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::peek::PeekableReader;
use crate::policy::{ActivityTimer, Policy};

/// Hard budget for dialing the cover server.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Copy bytes one way, feeding the shared idle timer.
async fn pump<R, W>(reader: &mut R, writer: &mut W, timer: &ActivityTimer) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        timer.update();
    }
}

/// Splice a classified-as-other connection to `127.0.0.1:<dest_port>`.
///
/// The buffered reader still holds every byte consumed during
/// classification; they reach the cover server first, followed by the rest
/// of the client stream.
pub(crate) async fn splice<R, W>(
    dest_port: u16,
    reader: &mut PeekableReader<R>,
    writer: &mut W,
    policy: Policy,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let target_addr = format!("127.0.0.1:{}", dest_port);
    let target = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target_addr))
        .await
        .map_err(|_| Error::Timeout(DIAL_TIMEOUT.as_millis() as u64))?
        .map_err(|e| {
            tracing::warn!("fallback dial to {} failed: {}", target_addr, e);
            Error::Network(e)
        })?;
    target.set_nodelay(true)?;

    tracing::debug!("fallback to {}", target_addr);

    let (mut target_reader, mut target_writer) = tokio::io::split(target);
    let timer = ActivityTimer::new(policy.timeouts.connection_idle);

    let request = async {
        pump(reader, &mut target_writer, &timer).await?;
        let _ = target_writer.shutdown().await;
        timer.set_timeout(policy.timeouts.downlink_only);
        Ok::<(), Error>(())
    };

    let response = async {
        pump(&mut target_reader, writer, &timer).await?;
        timer.set_timeout(policy.timeouts.uplink_only);
        Ok::<(), Error>(())
    };

    tokio::select! {
        result = async { tokio::try_join!(request, response) } => {
            result?;
        }
        _ = timer.expired() => {
            tracing::debug!("fallback idle, closing");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyManager;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_splice_replays_peeked_bytes() {
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

        // Longer than the 64-byte classification peek
        let client_bytes =
            b"GET / HTTP/1.1\r\nHost: x\r\nUser-Agent: curl/8.5.0\r\nAccept: */*\r\n\r\n";
        let (mut client, server_io) = tokio::io::duplex(4096);

        let splice_task = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server_io);
            let mut reader = PeekableReader::new(read_half);
            // Demux-style classification consumed the head of the stream
            reader.peek(64).await.unwrap();
            splice(
                port,
                &mut reader,
                &mut write_half,
                PolicyManager::new().for_level(0),
            )
            .await
        });

        client.write_all(client_bytes).await.unwrap();

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

        // Cover server received the stream from offset 0, peeked bytes included
        let received = cover.await.unwrap();
        assert_eq!(received, client_bytes);

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("OK"));

        splice_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dead_cover_server_errors() {
        let (_client, server_io) = tokio::io::duplex(256);
        let (read_half, mut write_half) = tokio::io::split(server_io);
        let mut reader = PeekableReader::new(read_half);

        // Port 1: nothing listens there
        let result = splice(
            1,
            &mut reader,
            &mut write_half,
            PolicyManager::new().for_level(0),
        )
        .await;
        assert!(result.is_err());
    }
}
