//! Shared output store of named time series.
//!
//! Only the ingestion pipeline (through its decoders) writes. Readers such
//! as a UI take a `snapshot()` and never mutate the live store. Cloning a
//! `SeriesStore` clones the handle, not the data.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tether_core::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPoint {
    pub timestamp: Timestamp,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesStore {
    numeric: Arc<DashMap<String, Vec<Point>>>,
    strings: Arc<DashMap<String, Vec<TextPoint>>>,
}

/// Immutable copy of the store, ordered by series name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub numeric: BTreeMap<String, Vec<Point>>,
    pub strings: BTreeMap<String, Vec<TextPoint>>,
}

impl StoreSnapshot {
    pub fn series_count(&self) -> usize {
        self.numeric.len() + self.strings.len()
    }

    pub fn point_count(&self) -> usize {
        self.numeric.values().map(Vec::len).sum::<usize>()
            + self.strings.values().map(Vec::len).sum::<usize>()
    }
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_point(&self, series: &str, timestamp: Timestamp, value: f64) {
        let point = Point { timestamp, value };
        match self.numeric.get_mut(series) {
            Some(mut existing) => existing.push(point),
            None => {
                self.numeric.entry(series.to_string()).or_default().push(point);
            }
        }
    }

    pub fn append_string(&self, series: &str, timestamp: Timestamp, text: &str) {
        let point = TextPoint {
            timestamp,
            text: text.to_string(),
        };
        match self.strings.get_mut(series) {
            Some(mut existing) => existing.push(point),
            None => {
                self.strings.entry(series.to_string()).or_default().push(point);
            }
        }
    }

    /// Merge a whole buffered series in one step.
    pub fn extend_points(&self, series: String, points: Vec<Point>) {
        self.numeric.entry(series).or_default().extend(points);
    }

    pub fn extend_strings(&self, series: String, points: Vec<TextPoint>) {
        self.strings.entry(series).or_default().extend(points);
    }

    pub fn points(&self, series: &str) -> Option<Vec<Point>> {
        self.numeric.get(series).map(|s| s.value().clone())
    }

    pub fn strings(&self, series: &str) -> Option<Vec<TextPoint>> {
        self.strings.get(series).map(|s| s.value().clone())
    }

    pub fn series_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .numeric
            .iter()
            .map(|e| e.key().clone())
            .chain(self.strings.iter().map(|e| e.key().clone()))
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.strings.is_empty()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            numeric: self
                .numeric
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            strings: self
                .strings
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    pub fn clear(&self) {
        self.numeric.clear();
        self.strings.clear();
    }
}
