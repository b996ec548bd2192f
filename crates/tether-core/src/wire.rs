//! Binary chunk frames, the data plane of a download.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "dataChunk\0"   10 bytes  tag, NUL-terminated
//! index            4 bytes  i32 chunk sequence number
//! records...                repeated until the frame is exhausted:
//!   channel_id     2 bytes  u16
//!   timestamp      8 bytes  u64, nanoseconds
//!   payload_len    4 bytes  u32
//!   payload        payload_len bytes
//! ```
//!
//! The frame arrives from the network as raw memory. Every field read is
//! bounds-checked against what is left of the buffer; decoding never reads
//! past the end and never panics.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I32, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::types::{ChunkView, MessageView};

/// Frame tag, including its terminator.
pub const CHUNK_TAG: [u8; 10] = *b"dataChunk\0";

pub const FRAME_HEADER_LEN: usize = 14;
pub const RECORD_HEADER_LEN: usize = 14;

// ── On-wire headers ───────────────────────────────────────────────────────────

/// Leading bytes of every chunk frame.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub tag: [u8; 10],
    pub index: I32<LittleEndian>,
}

assert_eq_size!(FrameHeader, [u8; FRAME_HEADER_LEN]);

/// Header of one message record. The payload follows immediately.
///
/// Also used verbatim for message records in the local cache file.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    pub channel_id: U16<LittleEndian>,
    pub timestamp: U64<LittleEndian>,
    pub payload_len: U32<LittleEndian>,
}

assert_eq_size!(RecordHeader, [u8; RECORD_HEADER_LEN]);

impl RecordHeader {
    pub fn for_message(message: &MessageView<'_>) -> Result<Self, WireError> {
        let payload_len = u32::try_from(message.payload.len())
            .map_err(|_| WireError::PayloadTooLarge(message.payload.len()))?;
        Ok(Self {
            channel_id: U16::new(message.channel_id),
            timestamp: U64::new(message.timestamp),
            payload_len: U32::new(payload_len),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("binary frame does not start with the dataChunk tag")]
    UnexpectedTag,

    #[error("corrupt frame at offset {offset}: need {needed} bytes, {remaining} remaining")]
    CorruptFrame {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("payload length {0} does not fit in a u32")]
    PayloadTooLarge(usize),
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Slice a binary frame into message views. The views borrow `frame`.
pub fn decode_chunk(frame: &[u8]) -> Result<ChunkView<'_>, WireError> {
    let header = FrameHeader::read_from_prefix(frame).ok_or(WireError::CorruptFrame {
        offset: 0,
        needed: FRAME_HEADER_LEN,
        remaining: frame.len(),
    })?;
    if header.tag != CHUNK_TAG {
        return Err(WireError::UnexpectedTag);
    }

    let mut offset = FRAME_HEADER_LEN;
    let mut messages = Vec::new();

    while offset < frame.len() {
        let rest = &frame[offset..];
        let record = RecordHeader::read_from_prefix(rest).ok_or(WireError::CorruptFrame {
            offset,
            needed: RECORD_HEADER_LEN,
            remaining: rest.len(),
        })?;
        offset += RECORD_HEADER_LEN;

        let len = record.payload_len.get() as usize;
        let remaining = frame.len() - offset;
        if len > remaining {
            return Err(WireError::CorruptFrame {
                offset,
                needed: len,
                remaining,
            });
        }

        messages.push(MessageView {
            channel_id: record.channel_id.get(),
            timestamp: record.timestamp.get(),
            payload: &frame[offset..offset + len],
        });
        offset += len;
    }

    Ok(ChunkView {
        index: header.index.get(),
        messages,
    })
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Append one record (header + payload) to `out`.
pub fn encode_record(out: &mut Vec<u8>, message: &MessageView<'_>) -> Result<(), WireError> {
    let header = RecordHeader::for_message(message)?;
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(message.payload);
    Ok(())
}

pub fn encode_chunk(chunk: &ChunkView<'_>) -> Result<Vec<u8>, WireError> {
    let body: usize = chunk
        .messages
        .iter()
        .map(|m| RECORD_HEADER_LEN + m.payload.len())
        .sum();
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body);

    let header = FrameHeader {
        tag: CHUNK_TAG,
        index: I32::new(chunk.index),
    };
    out.extend_from_slice(header.as_bytes());
    for message in &chunk.messages {
        encode_record(&mut out, message)?;
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
