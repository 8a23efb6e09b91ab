//! Wire framing for packets exchanged over byte streams.
//!
//! Every frame is a 4-byte little-endian body length followed by the body:
//!
//! ```text
//! +----------+-----------------+--------------+-------------------+---------+
//! | len: u32 | sender: [u8;16] | session: u64 | timestamp_ms: u64 | payload |
//! +----------+-----------------+--------------+-------------------+---------+
//!    LE                            LE             LE
//! ```
//!
//! `len` counts the body only (header plus payload) and may not exceed
//! [`MAX_FRAME_BODY`].

use crate::error::EnvError;
use crate::types::{NodeId, PacketEnvelope};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body in bytes.
pub const MAX_FRAME_BODY: usize = 65536;

/// Fixed part of the body preceding the payload.
pub const FRAME_HEADER_SIZE: usize = 32; // 16 + 8 + 8

/// Encodes a packet into a complete frame, length prefix included.
pub fn encode_frame(from: NodeId, packet: &PacketEnvelope) -> Result<Vec<u8>, EnvError> {
    let body_len = FRAME_HEADER_SIZE + packet.payload.len();
    if body_len > MAX_FRAME_BODY {
        return Err(EnvError::FrameTooLarge(body_len));
    }

    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(&from.to_bytes());
    frame.extend_from_slice(&packet.session.to_le_bytes());
    frame.extend_from_slice(&packet.timestamp_ms.to_le_bytes());
    frame.extend_from_slice(&packet.payload);
    Ok(frame)
}

/// Parses a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<(NodeId, PacketEnvelope), EnvError> {
    if body.len() < FRAME_HEADER_SIZE {
        return Err(EnvError::malformed(format!(
            "body of {} bytes is shorter than the {} byte header",
            body.len(),
            FRAME_HEADER_SIZE
        )));
    }

    let sender: [u8; 16] = body[0..16]
        .try_into()
        .map_err(|_| EnvError::malformed("sender id"))?;
    let session = u64::from_le_bytes(
        body[16..24]
            .try_into()
            .map_err(|_| EnvError::malformed("session"))?,
    );
    let timestamp_ms = u64::from_le_bytes(
        body[24..32]
            .try_into()
            .map_err(|_| EnvError::malformed("timestamp"))?,
    );

    Ok((
        NodeId::from_bytes(sender),
        PacketEnvelope::new(session, body[FRAME_HEADER_SIZE..].to_vec(), timestamp_ms),
    ))
}

/// Writes one frame to the stream.
pub async fn write_frame<W>(writer: &mut W, from: NodeId, packet: &PacketEnvelope) -> Result<(), EnvError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(from, packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(NodeId, PacketEnvelope)>, EnvError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buffer = [0u8; 4];
    match reader.read_exact(&mut len_buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_le_bytes(len_buffer) as usize;
    if body_len > MAX_FRAME_BODY {
        return Err(EnvError::FrameTooLarge(body_len));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}
