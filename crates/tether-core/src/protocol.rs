//! Control messages, the text half of the connection.
//!
//! Every control message is a JSON document:
//!
//! ```json
//! { "header": { "type": "getStatistics" }, "body": { "filename": "run1.log" } }
//! ```
//!
//! Requests flow client → server, replies server → client. Some type names
//! (`getFileList`, `getStatistics`, `downloadData`, `cancelDownload`) are
//! used in both directions with a different body, so each direction has its
//! own enum and its own decoder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DataRequest, FileInfo, Statistics};

// ── Message types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    GetFileList,
    GetStatistics,
    DownloadData,
    CancelDownload,
    TransferStarted,
    TransferCompleted,
    ErrorMessage,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetFileList => "getFileList",
            Self::GetStatistics => "getStatistics",
            Self::DownloadData => "downloadData",
            Self::CancelDownload => "cancelDownload",
            Self::TransferStarted => "transferStarted",
            Self::TransferCompleted => "transferCompleted",
            Self::ErrorMessage => "errorMessage",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "getFileList" => Some(Self::GetFileList),
            "getStatistics" => Some(Self::GetStatistics),
            "downloadData" => Some(Self::DownloadData),
            "cancelDownload" => Some(Self::CancelDownload),
            "transferStarted" => Some(Self::TransferStarted),
            "transferCompleted" => Some(Self::TransferCompleted),
            "errorMessage" => Some(Self::ErrorMessage),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("{0} is not valid in this direction")]
    UnexpectedType(MessageType),

    #[error("invalid body for {kind}: {source}")]
    InvalidBody {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    body: Value,
}

fn encode(kind: MessageType, body: Value) -> String {
    let envelope = Envelope {
        header: Header {
            kind: kind.as_str().to_string(),
        },
        body,
    };
    // Serializing a tree of `Value`s cannot fail.
    serde_json::to_string(&envelope).unwrap_or_default()
}

fn open(text: &[u8]) -> Result<(MessageType, Value), ProtocolError> {
    let envelope: Envelope = serde_json::from_slice(text).map_err(ProtocolError::Malformed)?;
    let kind = MessageType::parse(&envelope.header.kind)
        .ok_or(ProtocolError::UnknownType(envelope.header.kind))?;
    Ok((kind, envelope.body))
}

fn body<T: for<'de> Deserialize<'de>>(kind: MessageType, body: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|source| ProtocolError::InvalidBody { kind, source })
}

fn to_body<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ── Requests (client → server) ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetFileList,
    GetStatistics { filename: String },
    DownloadData(DataRequest),
    CancelDownload,
}

#[derive(Serialize, Deserialize)]
struct FilenameBody {
    filename: String,
}

impl Request {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::GetFileList => MessageType::GetFileList,
            Self::GetStatistics { .. } => MessageType::GetStatistics,
            Self::DownloadData(_) => MessageType::DownloadData,
            Self::CancelDownload => MessageType::CancelDownload,
        }
    }

    pub fn encode(&self) -> String {
        let body = match self {
            Self::GetFileList | Self::CancelDownload => Value::Null,
            Self::GetStatistics { filename } => to_body(&FilenameBody {
                filename: filename.clone(),
            }),
            Self::DownloadData(request) => to_body(request),
        };
        encode(self.kind(), body)
    }

    pub fn decode(text: &[u8]) -> Result<Self, ProtocolError> {
        let (kind, value) = open(text)?;
        match kind {
            MessageType::GetFileList => Ok(Self::GetFileList),
            MessageType::GetStatistics => {
                let b: FilenameBody = body(kind, value)?;
                Ok(Self::GetStatistics {
                    filename: b.filename,
                })
            }
            MessageType::DownloadData => Ok(Self::DownloadData(body(kind, value)?)),
            MessageType::CancelDownload => Ok(Self::CancelDownload),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

// ── Replies (server → client) ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    FileList(Vec<FileInfo>),
    Statistics(Statistics),
    /// Direct reply to `downloadData`, carrying the advertised chunk count.
    DownloadAccepted { chunk_count: i64 },
    TransferStarted { chunk_count: i64 },
    TransferCompleted,
    CancelAcknowledged,
    Error(String),
}

#[derive(Serialize, Deserialize)]
struct FileListBody {
    files: Vec<FileInfo>,
}

#[derive(Serialize, Deserialize)]
struct DownloadAcceptedBody {
    #[serde(rename = "chunksSize")]
    chunks_size: i64,
}

#[derive(Serialize, Deserialize)]
struct TransferStartedBody {
    #[serde(rename = "chunkCount")]
    chunk_count: i64,
}

impl Reply {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::FileList(_) => MessageType::GetFileList,
            Self::Statistics(_) => MessageType::GetStatistics,
            Self::DownloadAccepted { .. } => MessageType::DownloadData,
            Self::TransferStarted { .. } => MessageType::TransferStarted,
            Self::TransferCompleted => MessageType::TransferCompleted,
            Self::CancelAcknowledged => MessageType::CancelDownload,
            Self::Error(_) => MessageType::ErrorMessage,
        }
    }

    pub fn encode(&self) -> String {
        let body = match self {
            Self::FileList(files) => to_body(&FileListBody {
                files: files.clone(),
            }),
            Self::Statistics(statistics) => to_body(statistics),
            Self::DownloadAccepted { chunk_count } => to_body(&DownloadAcceptedBody {
                chunks_size: *chunk_count,
            }),
            Self::TransferStarted { chunk_count } => to_body(&TransferStartedBody {
                chunk_count: *chunk_count,
            }),
            Self::TransferCompleted | Self::CancelAcknowledged => Value::Null,
            Self::Error(message) => Value::String(message.clone()),
        };
        encode(self.kind(), body)
    }

    pub fn decode(text: &[u8]) -> Result<Self, ProtocolError> {
        let (kind, value) = open(text)?;
        match kind {
            MessageType::GetFileList => {
                let b: FileListBody = body(kind, value)?;
                Ok(Self::FileList(b.files))
            }
            MessageType::GetStatistics => Ok(Self::Statistics(body(kind, value)?)),
            MessageType::DownloadData => {
                let b: DownloadAcceptedBody = body(kind, value)?;
                Ok(Self::DownloadAccepted {
                    chunk_count: b.chunks_size,
                })
            }
            MessageType::TransferStarted => {
                let b: TransferStartedBody = body(kind, value)?;
                Ok(Self::TransferStarted {
                    chunk_count: b.chunk_count,
                })
            }
            MessageType::TransferCompleted => Ok(Self::TransferCompleted),
            MessageType::CancelDownload => Ok(Self::CancelAcknowledged),
            MessageType::ErrorMessage => Ok(Self::Error(body(kind, value)?)),
        }
    }
}
