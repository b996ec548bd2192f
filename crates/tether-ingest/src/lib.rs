//! tether-ingest: turns received messages into named time series.
//!
//! The pipeline resolves one decoder per channel through the registry,
//! feeds it messages in arrival order and merges the result into a shared
//! `SeriesStore`. The cache writer replicates the same messages into a
//! local container file that can be replayed later.

pub mod builtin;
pub mod cache;
pub mod decoder;
pub mod pipeline;
pub mod store;

pub use cache::{CacheContents, CacheError, CacheReader, CacheSummary, CacheWriter};
pub use decoder::{
    DecodeError, Decoder, DecoderFactory, DecoderOptions, DecoderRegistry, LargeArrayPolicy,
    TimestampSource,
};
pub use pipeline::{IngestReport, IngestionPipeline, SchemaFailure};
pub use store::{Point, SeriesStore, StoreSnapshot, TextPoint};
