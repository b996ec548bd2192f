//! Transport framing over a byte stream.
//!
//! Control messages (text) and chunk frames (binary) share one connection,
//! so each message travels in a small envelope:
//!
//! ```text
//! kind     1 byte   0x01 text, 0x02 binary
//! length   4 bytes  u32 little-endian, body length
//! body     length bytes
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ENVELOPE_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Text = 0x01,
    Binary = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Text),
            0x02 => Ok(FrameKind::Binary),
            other => Err(TransportError::UnknownFrameKind(other)),
        }
    }
}

/// One message on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Bytes,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            body: Bytes::from(text.into()),
        }
    }

    pub fn binary(body: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            body: body.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("frame too large: max {max} got {got}")]
    FrameTooLarge { max: usize, got: usize },

    #[error("connection closed mid-frame")]
    Truncated,
}

/// Read the next frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(TransportError::Truncated);
        }
        read += n;
    }

    let kind = FrameKind::try_from(header[0])?;
    let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            max: max_frame_bytes,
            got: length,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TransportError::Truncated,
        _ => TransportError::Io(e),
    })?;

    Ok(Some(Frame {
        kind,
        body: Bytes::from(body),
    }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(frame.body.len()).map_err(|_| TransportError::FrameTooLarge {
        max: u32::MAX as usize,
        got: frame.body.len(),
    })?;
    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    header[0] = frame.kind as u8;
    header[1..].copy_from_slice(&length.to_le_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.body).await?;
    writer.flush().await?;
    Ok(())
}
