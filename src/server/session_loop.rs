//! Post-handshake session loop: frame dispatch and the bidirectional pump.
//!
//! The first DATA frame names the upstream destination and may carry the
//! first payload bytes inline. Once the dispatcher provides a link, two
//! cooperating futures pump bytes until either side finishes, the idle
//! timer fires, or an error interrupts both.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::destination::{self, Destination};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::policy::{ActivityTimer, Policy};
use crate::server::User;
use crate::session::{FrameType, Session};

/// Read buffer size for the upstream→client direction.
const RESPONSE_BUF_SIZE: usize = 8192;

/// Drive one authenticated session until it ends.
pub(crate) async fn run<R, W>(
    session: Session,
    user: &User,
    reader: &mut R,
    writer: &mut W,
    dispatcher: &dyn Dispatcher,
    policy: Policy,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    // Control frames may arrive ahead of the first DATA frame; apply them
    // and keep waiting for the destination.
    let first_payload = loop {
        match session.read_frame(reader).await? {
            None => return Ok(()),
            Some(frame) => match frame.frame_type {
                FrameType::Data => break frame.payload,
                FrameType::Padding | FrameType::Timing => session.apply_control(&frame),
                FrameType::Close => return Ok(()),
            },
        }
    };

    let dest = Destination::parse(&first_payload)?;
    let header = destination::header_len(&first_payload)
        .ok_or_else(|| Error::invalid("destination header vanished"))?;
    let initial = &first_payload[header..];

    tracing::debug!(user = %user.email, dest = %dest, "session established");

    let link = dispatcher.dispatch(&dest).await?;
    let (mut up_reader, mut up_writer) = (link.reader, link.writer);

    let timer = ActivityTimer::new(policy.timeouts.connection_idle);

    // Client → upstream
    let request = async {
        if !initial.is_empty() {
            up_writer.write_all(initial).await?;
            timer.update();
        }

        loop {
            match session.read_frame(reader).await? {
                None => break,
                Some(frame) => match frame.frame_type {
                    FrameType::Data => {
                        up_writer.write_all(&frame.payload).await?;
                        timer.update();
                    }
                    FrameType::Close => break,
                    // Hints are not payload; nothing goes upstream
                    FrameType::Padding | FrameType::Timing => continue,
                },
            }
        }

        // Client is done sending; half-close upstream, bound the drain
        let _ = up_writer.shutdown().await;
        timer.set_timeout(policy.timeouts.downlink_only);
        Ok::<(), Error>(())
    };

    // Upstream → client, morphed when the session negotiated a profile
    let response = async {
        let mut buf = vec![0u8; RESPONSE_BUF_SIZE];
        loop {
            let n = up_reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            timer.update();

            match session.profile() {
                Some(profile) if session.morphing_enabled() => {
                    session
                        .write_frame_morphed(writer, FrameType::Data, &buf[..n], profile)
                        .await?;
                }
                _ => {
                    session
                        .write_frame(writer, FrameType::Data, &buf[..n])
                        .await?;
                }
            }
        }

        timer.set_timeout(policy.timeouts.uplink_only);
        Ok::<(), Error>(())
    };

    tokio::select! {
        result = async { tokio::try_join!(request, response) } => {
            result?;
        }
        _ = timer.expired() => {
            tracing::debug!(user = %user.email, "session idle, closing");
        }
    }

    Ok(())
}
