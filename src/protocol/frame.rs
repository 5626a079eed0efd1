//! Length-delimited frame I/O.
//!
//! Generalizes a single-fixed-header-per-message design to this crate's
//! model: a message is an ordered sequence of
//! independently-sized frames, each carrying a "more-follows" bit (spec.md
//! section 3/6). On the wire a frame is:
//!
//! ```text
//! [u32 LE length][u8 more-follows (0|1)][length bytes of payload]
//! ```
//!
//! little-endian throughout, per section 6 ("All multi-byte integers are
//! little-endian of the declared width").

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// One frame: an opaque byte payload plus whether another frame follows it
/// in the same message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub more: bool,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, more: bool) -> Self {
        Frame {
            data: data.into(),
            more,
        }
    }

    pub fn last(data: impl Into<Bytes>) -> Self {
        Frame::new(data, false)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reads one frame from an async byte stream.
///
/// Returns `Ok(None)` only when the stream is closed before any byte of a
/// new frame has been read (a clean end-of-message boundary); a stream that
/// closes mid-frame is `ProtocolError::ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let more = reader
        .read_u8()
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;

    Ok(Some(Frame::new(payload, more != 0)))
}

/// Writes one frame. Does not flush; callers typically write a whole message
/// (envelope + header + payload frames) before flushing once.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    writer
        .write_all(&(frame.data.len() as u32).to_le_bytes())
        .await?;
    writer.write_u8(if frame.more { 1 } else { 0 }).await?;
    writer.write_all(&frame.data).await?;
    Ok(())
}

/// Writes a whole message (slice of frames) and flushes once.
///
/// `more` on the last frame in `frames` is forced to `false` regardless of
/// what the caller set, mirroring "the absence of more-follows on the last
/// sent frame terminates" (spec.md section 6).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frames: &[Frame],
) -> std::io::Result<()> {
    for (i, frame) in frames.iter().enumerate() {
        let is_last = i + 1 == frames.len();
        if is_last && frame.more {
            let mut corrected = frame.clone();
            corrected.more = false;
            write_frame(writer, &corrected).await?;
        } else {
            write_frame(writer, frame).await?;
        }
    }
    writer.flush().await
}

/// Reads an entire message (every frame up to and including the first one
/// whose `more` bit is unset) into a `Vec`.
///
/// Returns `Ok(None)` if the connection closes cleanly before any frame of a
/// new message arrives.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<Frame>>, ProtocolError> {
    let mut frames = Vec::new();
    loop {
        match read_frame(reader).await? {
            None if frames.is_empty() => return Ok(None),
            None => return Err(ProtocolError::ConnectionClosed),
            Some(frame) => {
                let more = frame.more;
                frames.push(frame);
                if !more {
                    return Ok(Some(frames));
                }
            }
        }
    }
}
