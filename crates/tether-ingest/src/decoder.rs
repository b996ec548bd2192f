//! Decoder interfaces and the encoding → factory registry.
//!
//! One decoder instance exists per channel. It is configured once, fed
//! every message of its channel in order, and finalized at the end of the
//! transfer. New encodings register a factory; the pipeline never changes.

use std::collections::HashMap;
use std::sync::Arc;

use tether_core::config::DecodingConfig;
use tether_core::Timestamp;

use crate::store::SeriesStore;

// ── Options ───────────────────────────────────────────────────────────────────

/// What to do with arrays longer than the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeArrayPolicy {
    /// Keep the first `n` elements.
    Clamp(usize),
    /// Drop arrays longer than `n` entirely.
    Skip(usize),
}

impl LargeArrayPolicy {
    pub fn max_size(&self) -> usize {
        match self {
            Self::Clamp(n) | Self::Skip(n) => *n,
        }
    }
}

/// Which clock stamps the decoded points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// The timestamp carried next to the payload in the chunk frame.
    Transport,
    /// A timestamp field inside the payload, when the decoder finds one.
    Embedded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    pub large_arrays: LargeArrayPolicy,
    pub timestamp_source: TimestampSource,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self::from_config(&DecodingConfig::default())
    }
}

impl DecoderOptions {
    pub fn from_config(config: &DecodingConfig) -> Self {
        let large_arrays = if config.clamp_large_arrays {
            LargeArrayPolicy::Clamp(config.max_array_size)
        } else {
            LargeArrayPolicy::Skip(config.max_array_size)
        };
        let timestamp_source = if config.use_embedded_timestamp {
            TimestampSource::Embedded
        } else {
            TimestampSource::Transport
        };
        Self {
            large_arrays,
            timestamp_source,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid schema {schema}: {reason}")]
    InvalidSchema { schema: String, reason: String },

    #[error("payload is {got} bytes, expected {expected}")]
    WrongLength { expected: usize, got: usize },

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// Stateful per-channel decoder.
pub trait Decoder: Send {
    /// Applied once, before the first `feed`.
    fn configure(&mut self, options: &DecoderOptions);

    /// Decode one message. May append points to `store` directly or buffer
    /// them until `finalize`.
    fn feed(
        &mut self,
        payload: &[u8],
        timestamp: Timestamp,
        store: &SeriesStore,
    ) -> Result<(), DecodeError>;

    /// Commit anything still buffered. Called once, at the end of a transfer.
    fn finalize(&mut self, store: &SeriesStore);
}

/// Builds decoders for one encoding.
pub trait DecoderFactory: Send + Sync {
    /// Encoding identifier this factory is registered under.
    fn encoding(&self) -> &str;

    fn create(
        &self,
        topic: &str,
        schema_name: &str,
        schema: &[u8],
    ) -> Result<Box<dyn Decoder>, DecodeError>;
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Maps encoding identifiers to decoder factories.
#[derive(Default, Clone)]
pub struct DecoderRegistry {
    factories: HashMap<String, Arc<dyn DecoderFactory>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every decoder shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_all(&mut registry);
        registry
    }

    /// Register a factory under its own encoding name. Replaces any
    /// previous factory for that encoding.
    pub fn register(&mut self, factory: Arc<dyn DecoderFactory>) {
        let encoding = factory.encoding().to_string();
        if self.factories.insert(encoding.clone(), factory).is_some() {
            tracing::debug!(encoding, "decoder factory replaced");
        }
    }

    pub fn resolve(&self, encoding: &str) -> Option<Arc<dyn DecoderFactory>> {
        self.factories.get(encoding).cloned()
    }

    pub fn encodings(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
