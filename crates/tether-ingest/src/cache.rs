//! Local cache of a transfer.
//!
//! Messages are written as they arrive into a single record file:
//!
//! ```text
//! magic    "TETHER\x01\n"
//! record   opcode u8 | body_len u32 | body
//!   0x01 schema   id u16, name str, encoding str, data bytes
//!   0x02 channel  id u16, schema_id u16, topic str, message_encoding str
//!   0x03 message  channel_id u16, timestamp u64, payload bytes
//!   0x0F footer   message_count u64, channel_count u32, schema_count u32,
//!                 digest [u8; 32]
//! ```
//!
//! The footer digest is the BLAKE3 hash of every record before it.
//!
//! Integers are little-endian; `str` and `bytes` are a u32 length followed
//! by the data. Schemas and channels are registered lazily, the first time
//! a message needs them, and get fresh local ids starting at 0.
//!
//! The file is written under a `.tmp` name and renamed into place on close,
//! so a cache at its final path is always complete. A writer that is
//! abandoned or dropped without `close` removes its `.tmp` file instead.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tether_core::wire::{RecordHeader, RECORD_HEADER_LEN};
use tether_core::{
    ChannelId, ChannelInfo, DataRequest, MessageView, Statistics, Timestamp, WireError,
};
use zerocopy::{AsBytes, FromBytes};

use crate::pipeline::{IngestReport, IngestionPipeline};

pub const CACHE_MAGIC: [u8; 8] = *b"TETHER\x01\n";

const OP_SCHEMA: u8 = 0x01;
const OP_CHANNEL: u8 = 0x02;
const OP_MESSAGE: u8 = 0x03;
const OP_FOOTER: u8 = 0x0F;

const RECORD_PREFIX_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a tether cache file")]
    BadMagic,

    #[error("truncated cache record at offset {0}")]
    Truncated(usize),

    #[error("unknown record opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("invalid utf-8 in {0}")]
    InvalidString(&'static str),

    #[error("record references unknown {kind} {id}")]
    DanglingId { kind: &'static str, id: u16 },

    #[error("cache has no footer")]
    MissingFooter,

    #[error("footer counts {expected} messages, file holds {found}")]
    FooterMismatch { expected: u64, found: u64 },

    #[error("cache digest mismatch: footer {expected}, content {found}")]
    DigestMismatch { expected: String, found: String },

    #[error("too many {0} for one cache file")]
    IdsExhausted(&'static str),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What a closed writer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub path: PathBuf,
    pub message_count: u64,
    pub channel_count: u32,
    pub schema_count: u32,
    pub digest: [u8; 32],
}

impl CacheSummary {
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

#[derive(Hash, PartialEq, Eq)]
struct SchemaKey {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

pub struct CacheWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    out: Option<BufWriter<fs::File>>,
    request: DataRequest,
    /// Subscribed channels of the transfer, by remote id.
    remote: HashMap<ChannelId, ChannelInfo>,
    /// Remote channel id → local channel id.
    mapping: HashMap<ChannelId, ChannelId>,
    schemas: HashMap<SchemaKey, u16>,
    message_count: u64,
    body: Vec<u8>,
    hasher: blake3::Hasher,
}

impl CacheWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        statistics: &Statistics,
        request: &DataRequest,
    ) -> Result<Self, CacheError> {
        let path = path.into();
        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let file = fs::File::create(&tmp_path).map_err(|e| io_error(&tmp_path, e))?;
        let mut out = BufWriter::new(file);
        out.write_all(&CACHE_MAGIC)
            .map_err(|e| io_error(&tmp_path, e))?;

        let remote = statistics
            .channels
            .iter()
            .filter(|c| request.wants_topic(&c.topic))
            .map(|c| (c.id, c.clone()))
            .collect();

        tracing::debug!(path = %path.display(), "cache writer opened");

        Ok(Self {
            path,
            tmp_path,
            out: Some(out),
            request: request.clone(),
            remote,
            mapping: HashMap::new(),
            schemas: HashMap::new(),
            message_count: 0,
            body: Vec::new(),
            hasher: blake3::Hasher::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    /// Append one message. Messages for unsubscribed channels or outside
    /// the requested window are skipped, as are writes after `close`.
    pub fn record(&mut self, message: &MessageView<'_>) -> Result<(), CacheError> {
        if self.out.is_none() || !self.request.contains_time(message.timestamp) {
            return Ok(());
        }
        let local = match self.mapping.get(&message.channel_id) {
            Some(&local) => local,
            None => match self.register_channel(message.channel_id)? {
                Some(local) => local,
                None => return Ok(()),
            },
        };

        let header = RecordHeader::for_message(&MessageView {
            channel_id: local,
            ..*message
        })?;
        self.body.clear();
        self.body.extend_from_slice(header.as_bytes());
        self.body.extend_from_slice(message.payload);
        self.flush_record(OP_MESSAGE)?;
        self.message_count += 1;
        Ok(())
    }

    fn register_channel(&mut self, remote_id: ChannelId) -> Result<Option<ChannelId>, CacheError> {
        let Some(channel) = self.remote.get(&remote_id).cloned() else {
            return Ok(None);
        };

        let key = SchemaKey {
            name: channel.schema_name.clone(),
            encoding: channel.schema_encoding.clone(),
            data: channel.schema_data.clone(),
        };
        let schema_id = match self.schemas.get(&key) {
            Some(&id) => id,
            None => {
                let id = next_id(self.schemas.len(), "schemas")?;
                self.body.clear();
                put_u16(&mut self.body, id);
                put_bytes(&mut self.body, key.name.as_bytes())?;
                put_bytes(&mut self.body, key.encoding.as_bytes())?;
                put_bytes(&mut self.body, &key.data)?;
                self.flush_record(OP_SCHEMA)?;
                self.schemas.insert(key, id);
                id
            }
        };

        let local = next_id(self.mapping.len(), "channels")?;
        self.body.clear();
        put_u16(&mut self.body, local);
        put_u16(&mut self.body, schema_id);
        put_bytes(&mut self.body, channel.topic.as_bytes())?;
        put_bytes(&mut self.body, channel.message_encoding.as_bytes())?;
        self.flush_record(OP_CHANNEL)?;
        self.mapping.insert(remote_id, local);

        tracing::debug!(topic = %channel.topic, remote_id, local, "cache channel registered");
        Ok(Some(local))
    }

    fn flush_record(&mut self, opcode: u8) -> Result<(), CacheError> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        let len = u32::try_from(self.body.len())
            .map_err(|_| WireError::PayloadTooLarge(self.body.len()))?;
        let mut prefix = [0u8; RECORD_PREFIX_LEN];
        prefix[0] = opcode;
        prefix[1..].copy_from_slice(&len.to_le_bytes());
        out.write_all(&prefix)
            .and_then(|_| out.write_all(&self.body))
            .map_err(|e| io_error(&self.tmp_path, e))?;
        self.hasher.update(&prefix);
        self.hasher.update(&self.body);
        Ok(())
    }

    /// Write the footer and move the file into place. Only the first call
    /// does anything; later calls return `Ok(None)`. If publishing fails the
    /// partial file is removed.
    pub fn close(&mut self) -> Result<Option<CacheSummary>, CacheError> {
        if self.out.is_none() {
            return Ok(None);
        }
        match self.publish() {
            Ok(summary) => {
                tracing::info!(
                    path = %self.path.display(),
                    messages = summary.message_count,
                    channels = summary.channel_count,
                    digest = %summary.digest_hex(),
                    "cache written"
                );
                Ok(Some(summary))
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    fn publish(&mut self) -> Result<CacheSummary, CacheError> {
        let summary = CacheSummary {
            path: self.path.clone(),
            message_count: self.message_count,
            channel_count: self.mapping.len() as u32,
            schema_count: self.schemas.len() as u32,
            digest: *self.hasher.finalize().as_bytes(),
        };
        self.body.clear();
        self.body.extend_from_slice(&summary.message_count.to_le_bytes());
        self.body.extend_from_slice(&summary.channel_count.to_le_bytes());
        self.body.extend_from_slice(&summary.schema_count.to_le_bytes());
        self.body.extend_from_slice(&summary.digest);
        self.flush_record(OP_FOOTER)?;

        if let Some(out) = self.out.take() {
            let file = out
                .into_inner()
                .map_err(|e| io_error(&self.tmp_path, e.into_error()))?;
            file.sync_all().map_err(|e| io_error(&self.tmp_path, e))?;
        }
        fs::rename(&self.tmp_path, &self.path).map_err(|e| io_error(&self.path, e))?;
        Ok(summary)
    }

    /// Stop writing and delete the partial file. Nothing appears at the
    /// final path. Later `record` and `close` calls do nothing.
    pub fn abandon(&mut self) {
        let was_open = self.out.take().is_some();
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.tmp_path.display(), error = %e, "partial cache not removed")
            }
        }
        if was_open {
            tracing::debug!(path = %self.path.display(), "cache abandoned");
        }
    }
}

/// A writer that was never closed holds an incomplete file.
impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.out.is_some() {
            self.abandon();
        }
    }
}

fn next_id(used: usize, what: &'static str) -> Result<u16, CacheError> {
    u16::try_from(used).map_err(|_| CacheError::IdsExhausted(what))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<(), CacheError> {
    let len = u32::try_from(data.len()).map_err(|_| WireError::PayloadTooLarge(data.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// A message read back from a cache. Owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub channel_id: ChannelId,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl CachedMessage {
    pub fn as_view(&self) -> MessageView<'_> {
        MessageView {
            channel_id: self.channel_id,
            timestamp: self.timestamp,
            payload: &self.payload,
        }
    }
}

/// Everything a cache holds, in the shape a live transfer delivers it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheContents {
    /// File name of the cache, used as the replayed file name.
    pub filename: String,
    pub statistics: Statistics,
    pub messages: Vec<CachedMessage>,
}

impl CacheContents {
    /// Run every cached message through `pipeline` as one load.
    pub fn replay_into(&self, pipeline: &mut IngestionPipeline) -> IngestReport {
        let request = DataRequest::everything(self.filename.clone());
        pipeline.prepare(&self.statistics, &request);
        for message in &self.messages {
            pipeline.ingest_message(&message.as_view());
        }
        pipeline.finish()
    }
}

pub struct CacheReader {
    path: PathBuf,
    data: Vec<u8>,
}

struct SchemaRecord {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

impl CacheReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let data = fs::read(&path).map_err(|e| io_error(&path, e))?;
        if data.len() < CACHE_MAGIC.len() || data[..CACHE_MAGIC.len()] != CACHE_MAGIC {
            return Err(CacheError::BadMagic);
        }
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<CacheContents, CacheError> {
        let mut schemas: HashMap<u16, SchemaRecord> = HashMap::new();
        let mut channels: BTreeMap<ChannelId, ChannelInfo> = BTreeMap::new();
        let mut messages = Vec::new();
        let mut footer = None;

        let mut offset = CACHE_MAGIC.len();
        while offset < self.data.len() {
            let mut prefix = Cursor::new(&self.data, offset);
            let opcode = prefix.u8()?;
            let len = prefix.u32()? as usize;
            let body_start = prefix.pos;
            let body = prefix.take(len)?;
            let mut cur = Cursor::new(body, 0).based_at(body_start);

            match opcode {
                OP_SCHEMA => {
                    let id = cur.u16()?;
                    let record = SchemaRecord {
                        name: cur.string("schema name")?,
                        encoding: cur.string("schema encoding")?,
                        data: cur.bytes()?.to_vec(),
                    };
                    schemas.insert(id, record);
                }
                OP_CHANNEL => {
                    let id = cur.u16()?;
                    let schema_id = cur.u16()?;
                    let topic = cur.string("topic")?;
                    let message_encoding = cur.string("message encoding")?;
                    let schema = schemas.get(&schema_id).ok_or(CacheError::DanglingId {
                        kind: "schema",
                        id: schema_id,
                    })?;
                    channels.insert(
                        id,
                        ChannelInfo {
                            id,
                            topic,
                            schema_name: schema.name.clone(),
                            schema_encoding: schema.encoding.clone(),
                            schema_data: schema.data.clone(),
                            message_encoding,
                            message_count: 0,
                            start_time: 0,
                            end_time: 0,
                        },
                    );
                }
                OP_MESSAGE => {
                    let header = RecordHeader::read_from_prefix(body)
                        .ok_or(CacheError::Truncated(body_start))?;
                    let payload_len = header.payload_len.get() as usize;
                    let payload = body
                        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len)
                        .ok_or(CacheError::Truncated(body_start + RECORD_HEADER_LEN))?;
                    let channel_id = header.channel_id.get();
                    let timestamp = header.timestamp.get();

                    let channel = channels.get_mut(&channel_id).ok_or(CacheError::DanglingId {
                        kind: "channel",
                        id: channel_id,
                    })?;
                    if channel.message_count == 0 {
                        channel.start_time = timestamp;
                        channel.end_time = timestamp;
                    }
                    channel.message_count += 1;
                    channel.start_time = channel.start_time.min(timestamp);
                    channel.end_time = channel.end_time.max(timestamp);

                    messages.push(CachedMessage {
                        channel_id,
                        timestamp,
                        payload: payload.to_vec(),
                    });
                }
                OP_FOOTER => {
                    let count = cur.u64()?;
                    let _channels = cur.u32()?;
                    let _schemas = cur.u32()?;
                    let digest: [u8; 32] = cur.array()?;
                    footer = Some((count, digest, offset));
                }
                other => {
                    return Err(CacheError::UnknownOpcode {
                        opcode: other,
                        offset,
                    })
                }
            }
            offset = body_start + len;
        }

        let (expected, digest, footer_offset) = footer.ok_or(CacheError::MissingFooter)?;
        let found = messages.len() as u64;
        if expected != found {
            return Err(CacheError::FooterMismatch { expected, found });
        }
        let content = blake3::hash(&self.data[CACHE_MAGIC.len()..footer_offset]);
        if content.as_bytes() != &digest {
            return Err(CacheError::DigestMismatch {
                expected: hex::encode(digest),
                found: content.to_hex().to_string(),
            });
        }

        let active = channels.values().filter(|c| c.message_count > 0);
        let statistics = Statistics {
            library: "tether-cache".to_string(),
            profile: String::new(),
            message_count: found,
            start_time: active.clone().map(|c| c.start_time).min().unwrap_or(0),
            end_time: active.map(|c| c.end_time).max().unwrap_or(0),
            channels: channels.into_values().collect(),
        };

        Ok(CacheContents {
            filename: self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            statistics,
            messages,
        })
    }
}

/// Bounds-checked little-endian reads over one record.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos, base: 0 }
    }

    /// Report offsets relative to the whole file.
    fn based_at(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CacheError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CacheError::Truncated(self.base + self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CacheError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CacheError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CacheError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CacheError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn bytes(&mut self) -> Result<&'a [u8], CacheError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self, field: &'static str) -> Result<String, CacheError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CacheError::InvalidString(field))
    }
}
