//! tether-client: browse a remote telemetry server and stream files into
//! the ingestion pipeline.
//!
//! `session` holds the transfer state machine and performs no I/O. `client`
//! drives it from a single tokio task that owns the connection. `sink`
//! receives accepted chunks and writes them into the store and cache.

pub mod client;
pub mod session;
pub mod sink;

pub use client::{spawn, ClientError, ClientHandle};
pub use session::{
    Action, Input, Session, SessionError, SessionEvent, SessionState, TransferOutcome,
};
pub use sink::{IngestSink, TransferSink};
