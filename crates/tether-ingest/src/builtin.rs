//! Decoders shipped with the crate.
//!
//! `uint32` and `string` write straight into the store. `json` discovers its
//! field set as it goes, so it buffers per-field series and commits them
//! under `<topic>/<path>` only when finalized.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tether_core::Timestamp;

use crate::decoder::{
    DecodeError, Decoder, DecoderFactory, DecoderOptions, DecoderRegistry, LargeArrayPolicy,
    TimestampSource,
};
use crate::store::{Point, SeriesStore, TextPoint};

pub const UINT32_ENCODING: &str = "uint32";
pub const STRING_ENCODING: &str = "string";
pub const JSON_ENCODING: &str = "json";

pub fn register_all(registry: &mut DecoderRegistry) {
    registry.register(Arc::new(Uint32Factory));
    registry.register(Arc::new(StringFactory));
    registry.register(Arc::new(JsonFactory));
}

// ── uint32 ────────────────────────────────────────────────────────────────────

pub struct Uint32Factory;

impl DecoderFactory for Uint32Factory {
    fn encoding(&self) -> &str {
        UINT32_ENCODING
    }

    fn create(&self, topic: &str, _: &str, _: &[u8]) -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(Box::new(Uint32Decoder {
            series: topic.to_string(),
        }))
    }
}

/// One little-endian u32 per message.
struct Uint32Decoder {
    series: String,
}

impl Decoder for Uint32Decoder {
    fn configure(&mut self, _: &DecoderOptions) {}

    fn feed(
        &mut self,
        payload: &[u8],
        timestamp: Timestamp,
        store: &SeriesStore,
    ) -> Result<(), DecodeError> {
        let bytes: [u8; 4] = payload.try_into().map_err(|_| DecodeError::WrongLength {
            expected: 4,
            got: payload.len(),
        })?;
        store.append_point(&self.series, timestamp, u32::from_le_bytes(bytes) as f64);
        Ok(())
    }

    fn finalize(&mut self, _: &SeriesStore) {}
}

// ── string ────────────────────────────────────────────────────────────────────

pub struct StringFactory;

impl DecoderFactory for StringFactory {
    fn encoding(&self) -> &str {
        STRING_ENCODING
    }

    fn create(&self, topic: &str, _: &str, _: &[u8]) -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(Box::new(StringDecoder {
            series: topic.to_string(),
        }))
    }
}

struct StringDecoder {
    series: String,
}

impl Decoder for StringDecoder {
    fn configure(&mut self, _: &DecoderOptions) {}

    fn feed(
        &mut self,
        payload: &[u8],
        timestamp: Timestamp,
        store: &SeriesStore,
    ) -> Result<(), DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
        store.append_string(&self.series, timestamp, text);
        Ok(())
    }

    fn finalize(&mut self, _: &SeriesStore) {}
}

// ── json ──────────────────────────────────────────────────────────────────────

/// Field carrying an embedded timestamp, in nanoseconds.
const EMBEDDED_TIMESTAMP_FIELD: &str = "timestamp";

pub struct JsonFactory;

impl DecoderFactory for JsonFactory {
    fn encoding(&self) -> &str {
        JSON_ENCODING
    }

    /// An empty schema decodes every field. Otherwise the schema must be a
    /// JSON object, optionally restricting top-level fields:
    /// `{"fields": ["x", "y"]}`.
    fn create(
        &self,
        topic: &str,
        schema_name: &str,
        schema: &[u8],
    ) -> Result<Box<dyn Decoder>, DecodeError> {
        let invalid = |reason: String| DecodeError::InvalidSchema {
            schema: schema_name.to_string(),
            reason,
        };

        let fields = if schema.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            let value: Value =
                serde_json::from_slice(schema).map_err(|e| invalid(e.to_string()))?;
            let object = value
                .as_object()
                .ok_or_else(|| invalid("schema must be a JSON object".into()))?;
            match object.get("fields") {
                None => None,
                Some(Value::Array(names)) => Some(
                    names
                        .iter()
                        .map(|n| {
                            n.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| invalid("field names must be strings".into()))
                        })
                        .collect::<Result<BTreeSet<_>, _>>()?,
                ),
                Some(_) => return Err(invalid("\"fields\" must be an array".into())),
            }
        };

        Ok(Box::new(JsonDecoder {
            topic: topic.to_string(),
            fields,
            options: DecoderOptions::default(),
            numeric: BTreeMap::new(),
            text: BTreeMap::new(),
        }))
    }
}

struct JsonDecoder {
    topic: String,
    fields: Option<BTreeSet<String>>,
    options: DecoderOptions,
    numeric: BTreeMap<String, Vec<Point>>,
    text: BTreeMap<String, Vec<TextPoint>>,
}

impl JsonDecoder {
    fn flatten(&mut self, path: &str, value: &Value, timestamp: Timestamp) {
        match value {
            Value::Null => {}
            Value::Bool(b) => self.push_number(path, timestamp, if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    self.push_number(path, timestamp, v);
                }
            }
            Value::String(s) => self
                .text
                .entry(path.to_string())
                .or_default()
                .push(TextPoint {
                    timestamp,
                    text: s.clone(),
                }),
            Value::Array(items) => {
                let take = match self.options.large_arrays {
                    LargeArrayPolicy::Clamp(max) => items.len().min(max),
                    LargeArrayPolicy::Skip(max) if items.len() > max => return,
                    LargeArrayPolicy::Skip(_) => items.len(),
                };
                for (i, item) in items.iter().take(take).enumerate() {
                    self.flatten(&format!("{path}[{i}]"), item, timestamp);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.flatten(&format!("{path}/{key}"), item, timestamp);
                }
            }
        }
    }

    fn push_number(&mut self, path: &str, timestamp: Timestamp, value: f64) {
        self.numeric
            .entry(path.to_string())
            .or_default()
            .push(Point { timestamp, value });
    }
}

impl Decoder for JsonDecoder {
    fn configure(&mut self, options: &DecoderOptions) {
        self.options = *options;
    }

    fn feed(
        &mut self,
        payload: &[u8],
        timestamp: Timestamp,
        _store: &SeriesStore,
    ) -> Result<(), DecodeError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(DecodeError::Malformed("message is not a JSON object".into()));
        };

        let timestamp = match self.options.timestamp_source {
            TimestampSource::Embedded => object
                .get(EMBEDDED_TIMESTAMP_FIELD)
                .and_then(Value::as_u64)
                .unwrap_or(timestamp),
            TimestampSource::Transport => timestamp,
        };

        let topic = self.topic.clone();
        for (key, item) in &object {
            if let Some(fields) = &self.fields {
                if !fields.contains(key) {
                    continue;
                }
            }
            self.flatten(&format!("{topic}/{key}"), item, timestamp);
        }
        Ok(())
    }

    fn finalize(&mut self, store: &SeriesStore) {
        for (series, points) in std::mem::take(&mut self.numeric) {
            store.extend_points(series, points);
        }
        for (series, points) in std::mem::take(&mut self.text) {
            store.extend_strings(series, points);
        }
    }
}
