use anyhow::{bail, Context};
use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger means a corrupt or hostile
/// peer rather than a real message.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Read one frame from a stream and deserialize it.
///
/// The stream format consists of:
/// 1. Length header (u32, big-endian) - Size of the serialized JSON payload
/// 2. JSON payload (length bytes) - The serialized value
///
/// Returns `None` on a clean end of stream (the peer closed before sending
/// another header), which is how queue and socket consumers notice the other
/// side going away.
pub async fn read_frame<R, T>(stream: &mut R) -> Result<Option<T>, anyhow::Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned + Debug,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("reading frame length"),
    };
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds limit of {MAX_FRAME_LEN} bytes");
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.context("reading frame payload")?;
    let value = serde_json::from_slice(&payload).context("deserializing frame payload")?;

    trace!(len, value:?; "Read frame from stream");
    Ok(Some(value))
}

/// Serialize a value and write it to a stream as one frame.
pub async fn write_frame<W, T>(stream: &mut W, value: &T) -> Result<(), anyhow::Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize + Debug,
{
    let payload = serde_json::to_vec(value).context("serializing frame payload")?;
    let len = u32::try_from(payload.len()).context("frame payload too large")?;
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds limit of {MAX_FRAME_LEN} bytes");
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await.context("writing frame")?;
    stream.flush().await.context("flushing frame")?;

    trace!(len, value:?; "Wrote frame to stream");
    Ok(())
}
