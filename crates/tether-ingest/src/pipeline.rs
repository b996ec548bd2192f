//! Ingestion pipeline: one decoder per channel, fed in arrival order.
//!
//! A load starts with `prepare`, which resolves decoders for the requested
//! topics, then any number of `ingest` calls, then exactly one `finish`.
//! Problems are collected into an `IngestReport` instead of being returned:
//! a bad schema or an unknown encoding only costs the affected channels.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tether_core::{ChannelId, ChannelInfo, ChunkView, DataRequest, MessageView, Statistics};

use crate::decoder::{Decoder, DecoderFactory, DecoderOptions, DecoderRegistry};
use crate::store::SeriesStore;

/// Shown for a channel that names no encoding at all.
const NO_ENCODING: &str = "<none>";

// ── Report ────────────────────────────────────────────────────────────────────

/// A schema whose decoder could not be built, and every topic it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFailure {
    pub schema: String,
    pub error: String,
    pub topics: BTreeSet<String>,
}

/// Outcome of one load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub decoded: u64,
    pub failed: u64,
    /// Messages with no decoder or outside the requested time window.
    pub discarded: u64,
    /// Sorted, one entry per distinct encoding.
    pub unsupported_encodings: Vec<String>,
    /// Sorted by schema name.
    pub schema_failures: Vec<SchemaFailure>,
}

impl IngestReport {
    pub fn has_warnings(&self) -> bool {
        self.failed > 0 || !self.unsupported_encodings.is_empty() || !self.schema_failures.is_empty()
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} messages decoded, {} failed, {} discarded",
            self.decoded, self.failed, self.discarded
        )?;
        if !self.unsupported_encodings.is_empty() {
            write!(
                f,
                "\nno decoder for encoding: {}",
                self.unsupported_encodings.join(", ")
            )?;
        }
        for failure in &self.schema_failures {
            let topics: Vec<&str> = failure.topics.iter().map(String::as_str).collect();
            write!(
                f,
                "\nschema {} failed ({}); skipped topics: {}",
                failure.schema,
                failure.error,
                topics.join(", ")
            )?;
        }
        Ok(())
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct IngestionPipeline {
    registry: Arc<DecoderRegistry>,
    store: SeriesStore,
    options: DecoderOptions,
    request: Option<DataRequest>,
    decoders: HashMap<ChannelId, Box<dyn Decoder>>,
    unsupported: BTreeSet<String>,
    failures: BTreeMap<String, SchemaFailure>,
    decoded: u64,
    failed: u64,
    discarded: u64,
}

impl IngestionPipeline {
    pub fn new(registry: Arc<DecoderRegistry>, store: SeriesStore, options: DecoderOptions) -> Self {
        Self {
            registry,
            store,
            options,
            request: None,
            decoders: HashMap::new(),
            unsupported: BTreeSet::new(),
            failures: BTreeMap::new(),
            decoded: 0,
            failed: 0,
            discarded: 0,
        }
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    /// Number of channels that received a decoder in the current load.
    pub fn active_channels(&self) -> usize {
        self.decoders.len()
    }

    /// Start a new load. The store and any state from a previous load are
    /// dropped.
    pub fn prepare(&mut self, statistics: &Statistics, request: &DataRequest) {
        self.store.clear();
        self.decoders.clear();
        self.unsupported.clear();
        self.failures.clear();
        self.decoded = 0;
        self.failed = 0;
        self.discarded = 0;
        self.request = Some(request.clone());

        for channel in statistics
            .channels
            .iter()
            .filter(|c| request.wants_topic(&c.topic))
        {
            self.prepare_channel(channel);
        }

        tracing::info!(
            file = %request.filename,
            channels = self.decoders.len(),
            unsupported = self.unsupported.len(),
            failed_schemas = self.failures.len(),
            "ingestion prepared"
        );
    }

    fn prepare_channel(&mut self, channel: &ChannelInfo) {
        // A schema that failed once is not retried for the rest of the load.
        if let Some(failure) = self.failures.get_mut(&channel.schema_name) {
            failure.topics.insert(channel.topic.clone());
            return;
        }

        let Some(factory) = self.resolve(channel) else {
            let encoding = [&channel.message_encoding, &channel.schema_encoding]
                .into_iter()
                .find(|e| !e.is_empty())
                .map_or(NO_ENCODING, String::as_str);
            if self.unsupported.insert(encoding.to_string()) {
                tracing::warn!(encoding, topic = %channel.topic, "no decoder for encoding");
            }
            return;
        };

        match factory.create(&channel.topic, &channel.schema_name, &channel.schema_data) {
            Ok(mut decoder) => {
                decoder.configure(&self.options);
                self.decoders.insert(channel.id, decoder);
            }
            Err(e) => {
                tracing::warn!(
                    schema = %channel.schema_name,
                    topic = %channel.topic,
                    error = %e,
                    "decoder construction failed, schema skipped"
                );
                self.failures.insert(
                    channel.schema_name.clone(),
                    SchemaFailure {
                        schema: channel.schema_name.clone(),
                        error: e.to_string(),
                        topics: BTreeSet::from([channel.topic.clone()]),
                    },
                );
            }
        }
    }

    fn resolve(&self, channel: &ChannelInfo) -> Option<Arc<dyn DecoderFactory>> {
        self.registry
            .resolve(&channel.message_encoding)
            .or_else(|| self.registry.resolve(&channel.schema_encoding))
    }

    pub fn ingest(&mut self, chunk: &ChunkView<'_>) {
        for message in &chunk.messages {
            self.ingest_message(message);
        }
    }

    pub fn ingest_message(&mut self, message: &MessageView<'_>) {
        let in_window = self
            .request
            .as_ref()
            .is_some_and(|r| r.contains_time(message.timestamp));
        if !in_window {
            self.discarded += 1;
            return;
        }

        let Some(decoder) = self.decoders.get_mut(&message.channel_id) else {
            self.discarded += 1;
            return;
        };

        match decoder.feed(message.payload, message.timestamp, &self.store) {
            Ok(()) => self.decoded += 1,
            Err(e) => {
                self.failed += 1;
                tracing::debug!(
                    channel_id = message.channel_id,
                    timestamp = message.timestamp,
                    error = %e,
                    "message decode failed"
                );
            }
        }
    }

    /// Counters and warnings so far.
    pub fn report(&self) -> IngestReport {
        IngestReport {
            decoded: self.decoded,
            failed: self.failed,
            discarded: self.discarded,
            unsupported_encodings: self.unsupported.iter().cloned().collect(),
            schema_failures: self.failures.values().cloned().collect(),
        }
    }

    /// Finalize every decoder and end the load.
    pub fn finish(&mut self) -> IngestReport {
        for decoder in self.decoders.values_mut() {
            decoder.finalize(&self.store);
        }
        self.decoders.clear();
        self.request = None;

        let report = self.report();
        if report.has_warnings() {
            tracing::warn!("ingestion finished with warnings:\n{report}");
        } else {
            tracing::info!(decoded = report.decoded, discarded = report.discarded, "ingestion finished");
        }
        report
    }
}
