//! Traffic morphing: shaping egress frames to resemble a chosen pattern.
//!
//! The morphing writer splits oversized payloads into profile-sized chunks,
//! pads the tail with random bytes up to the sampled target, and sleeps the
//! sampled delay between frames. PADDING and TIMING control frames let the
//! peer steer a single upcoming frame.
//!
//! Padding lives inside the AEAD plaintext, so on the wire a padded frame is
//! indistinguishable from a full one; the layer above the decoder must
//! tolerate trailing bytes.

mod profile;

pub use profile::{by_name, TrafficProfile};

use std::time::Duration;

use tokio::io::AsyncWrite;

use crate::crypto::random_padding;
use crate::error::Result;
use crate::session::{Frame, FrameType, Session, MAX_PLAINTEXT_SIZE};

impl Session {
    /// Write a frame shaped by the given traffic profile.
    ///
    /// The payload is emitted as one or more frames whose plaintext lengths
    /// come from the profile's size distribution; each frame is followed by
    /// a sampled inter-frame delay. Original bytes appear in order at the
    /// front of the concatenated plaintexts.
    pub async fn write_frame_morphed<W>(
        &self,
        writer: &mut W,
        frame_type: FrameType,
        data: &[u8],
        profile: &TrafficProfile,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rest = data;
        loop {
            // Overrides arrive from the wire; keep the padded frame encryptable
            let target = profile.get_packet_size().clamp(1, MAX_PLAINTEXT_SIZE);

            if rest.len() > target {
                self.write_frame(writer, frame_type, &rest[..target]).await?;
                tokio::time::sleep(profile.get_delay()).await;
                rest = &rest[target..];
                continue;
            }

            let mut padded = rest.to_vec();
            padded.extend_from_slice(&random_padding(target - rest.len()));
            self.write_frame(writer, frame_type, &padded).await?;
            tokio::time::sleep(profile.get_delay()).await;
            return Ok(());
        }
    }

    /// Ask the peer to pad its next frame to `target_size` bytes.
    pub async fn send_padding_control<W>(&self, writer: &mut W, target_size: u16) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_frame(writer, FrameType::Padding, &target_size.to_be_bytes())
            .await
    }

    /// Ask the peer to delay its next frame by `delay` (millisecond
    /// granularity on the wire).
    pub async fn send_timing_control<W>(&self, writer: &mut W, delay: Duration) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let millis = delay.as_millis() as u64;
        self.write_frame(writer, FrameType::Timing, &millis.to_be_bytes())
            .await
    }

    /// Apply an inbound control frame as a one-shot override on this
    /// session's profile. Frames that are not control frames, carry short
    /// payloads, or arrive on a profile-less session are ignored.
    pub fn apply_control(&self, frame: &Frame) {
        let Some(profile) = self.profile() else {
            return;
        };

        match frame.frame_type {
            FrameType::Padding => {
                if frame.payload.len() >= 2 {
                    let target = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                    profile.set_next_packet_size(target as usize);
                }
            }
            FrameType::Timing => {
                if frame.payload.len() >= 8 {
                    let millis = u64::from_be_bytes(frame.payload[..8].try_into().unwrap());
                    profile.set_next_delay(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
    }
}
