//! CLI command modules.

pub mod browse;
pub mod connection;
pub mod download;
pub mod print;
pub mod replay;

use std::sync::Arc;

use tether_client::IngestSink;
use tether_core::config::TetherConfig;
use tether_ingest::{DecoderOptions, DecoderRegistry, IngestionPipeline, SeriesStore};

fn pipeline(config: &TetherConfig) -> IngestionPipeline {
    IngestionPipeline::new(
        Arc::new(DecoderRegistry::with_builtin()),
        SeriesStore::new(),
        DecoderOptions::from_config(&config.decoding),
    )
}

fn ingest_sink(config: &TetherConfig) -> IngestSink {
    IngestSink::new(pipeline(config))
}
