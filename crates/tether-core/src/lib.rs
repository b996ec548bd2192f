//! tether-core: shared data model, wire codec, control protocol and
//! transport framing. All other Tether crates depend on this one.

pub mod config;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod wire;

pub use protocol::{MessageType, ProtocolError, Reply, Request};
pub use types::{
    ChannelId, ChannelInfo, ChunkView, DataRequest, FileInfo, MessageView, Statistics, Timestamp,
};
pub use wire::WireError;
