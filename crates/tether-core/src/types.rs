//! Data model shared by the client, the ingestion pipeline and the cache.
//!
//! Owned types (`FileInfo`, `ChannelInfo`, `Statistics`, `DataRequest`) travel
//! inside control messages as JSON. The view types (`MessageView`,
//! `ChunkView`) borrow the binary frame they were sliced from and never
//! outlive it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Nanoseconds since the epoch.
pub type Timestamp = u64;

/// Channel identifier, unique within one `Statistics` snapshot.
pub type ChannelId = u16;

/// Open upper bound for a time range.
pub const MAX_TIME: Timestamp = Timestamp::MAX;

// ── File listing ──────────────────────────────────────────────────────────────

/// One file the server can stream from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "filename")]
    pub name: String,

    #[serde(rename = "size")]
    pub size_megabytes: f64,

    #[serde(rename = "dateTime")]
    pub modified: String,
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Per-channel summary computed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(rename = "channel_id")]
    pub id: ChannelId,
    pub topic: String,
    pub schema_name: String,
    pub schema_encoding: String,
    /// Schema definition. May be binary.
    #[serde(with = "schema_bytes")]
    pub schema_data: Vec<u8>,
    pub message_encoding: String,
    pub message_count: u64,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

/// Summary of one file. Every channel id referenced by a later message
/// must appear in `channels`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub library: String,
    pub profile: String,
    pub message_count: u64,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub channels: Vec<ChannelInfo>,
}

impl Statistics {
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.topic.as_str())
    }

    /// Duration covered by the file, in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.end_time.saturating_sub(self.start_time) as f64 * 1e-9
    }
}

// ── Download request ──────────────────────────────────────────────────────────

/// A download of a topic subset over `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub filename: String,
    pub topics: BTreeSet<String>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time range: end {end} is before start {start}")]
pub struct InvalidTimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl DataRequest {
    pub fn new<I, T>(
        filename: impl Into<String>,
        topics: I,
        start_time: Timestamp,
        end_time: Timestamp,
    ) -> Result<Self, InvalidTimeRange>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        if end_time < start_time {
            return Err(InvalidTimeRange {
                start: start_time,
                end: end_time,
            });
        }
        Ok(Self {
            filename: filename.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            start_time,
            end_time,
        })
    }

    /// Every topic, full time range.
    pub fn everything(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            topics: BTreeSet::new(),
            start_time: 0,
            end_time: MAX_TIME,
        }
    }

    /// An empty topic set selects every topic.
    pub fn wants_topic(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.contains(topic)
    }

    pub fn contains_time(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }
}

// ── Views over a received frame ──────────────────────────────────────────────

/// One message inside a chunk. Borrows the chunk buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageView<'a> {
    pub channel_id: ChannelId,
    pub timestamp: Timestamp,
    pub payload: &'a [u8],
}

/// One binary frame worth of messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkView<'a> {
    /// Sequence number, informational only. -1 means unset.
    pub index: i32,
    pub messages: Vec<MessageView<'a>>,
}

impl Default for ChunkView<'_> {
    fn default() -> Self {
        Self {
            index: -1,
            messages: Vec::new(),
        }
    }
}

// ── Schema bytes ─────────────────────────────────────────────────────────────

/// Schema definitions are usually text (IDL, .proto, JSON) and go on the
/// wire as a string. Binary definitions fall back to an array of bytes.
mod schema_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(data) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(data.iter()),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}
