//! Where accepted chunks go.

use std::path::Path;

use anyhow::Context;
use tether_core::{ChunkView, DataRequest, Statistics};
use tether_ingest::{CacheWriter, IngestReport, IngestionPipeline, SeriesStore};

use crate::session::TransferOutcome;

/// Receives one transfer at a time: `begin`, any number of `chunk`, then
/// `finish` exactly once.
pub trait TransferSink: Send + 'static {
    fn begin(
        &mut self,
        statistics: &Statistics,
        request: &DataRequest,
        cache: Option<&Path>,
    ) -> anyhow::Result<()>;

    fn chunk(&mut self, chunk: &ChunkView<'_>);

    /// `None` if no transfer was active.
    fn finish(&mut self, outcome: TransferOutcome) -> Option<IngestReport>;
}

/// Feeds the ingestion pipeline and, when asked, a local cache file.
pub struct IngestSink {
    pipeline: IngestionPipeline,
    cache: Option<CacheWriter>,
    active: bool,
}

impl IngestSink {
    pub fn new(pipeline: IngestionPipeline) -> Self {
        Self {
            pipeline,
            cache: None,
            active: false,
        }
    }

    pub fn store(&self) -> &SeriesStore {
        self.pipeline.store()
    }
}

impl TransferSink for IngestSink {
    fn begin(
        &mut self,
        statistics: &Statistics,
        request: &DataRequest,
        cache: Option<&Path>,
    ) -> anyhow::Result<()> {
        self.cache = match cache {
            Some(path) => Some(
                CacheWriter::create(path, statistics, request)
                    .with_context(|| format!("failed to create cache {}", path.display()))?,
            ),
            None => None,
        };
        self.pipeline.prepare(statistics, request);
        self.active = true;
        Ok(())
    }

    fn chunk(&mut self, chunk: &ChunkView<'_>) {
        if !self.active {
            return;
        }
        for message in &chunk.messages {
            self.pipeline.ingest_message(message);
            if let Some(writer) = self.cache.as_mut() {
                if let Err(e) = writer.record(message) {
                    tracing::warn!(error = %e, "cache write failed, cache abandoned");
                    writer.abandon();
                    self.cache = None;
                }
            }
        }
    }

    fn finish(&mut self, outcome: TransferOutcome) -> Option<IngestReport> {
        if !self.active {
            return None;
        }
        self.active = false;

        if let Some(mut writer) = self.cache.take() {
            match writer.close() {
                Ok(Some(summary)) => tracing::debug!(
                    path = %summary.path.display(),
                    messages = summary.message_count,
                    %outcome,
                    "cache closed"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "cache close failed"),
            }
        }
        Some(self.pipeline.finish())
    }
}
