//! `download`: stream a file subset into the store and optionally a cache.

use std::path::PathBuf;

use anyhow::{Context, Result};

use tether_core::config::TetherConfig;
use tether_core::types::MAX_TIME;
use tether_core::{DataRequest, Statistics, Timestamp};

use super::connection::Connection;
use super::print;

#[derive(Debug, Default)]
pub struct DownloadArgs {
    pub filename: String,
    pub topics: Vec<String>,
    /// Seconds from the start of the file.
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub cache: Option<PathBuf>,
}

fn offset(statistics: &Statistics, secs: f64) -> Timestamp {
    statistics
        .start_time
        .saturating_add((secs.max(0.0) * 1e9) as Timestamp)
}

impl DownloadArgs {
    fn request(&self, statistics: &Statistics) -> Result<DataRequest> {
        let start = self.start.map_or(statistics.start_time, |s| offset(statistics, s));
        let end = self.end.map_or(MAX_TIME, |s| offset(statistics, s));
        DataRequest::new(&self.filename, &self.topics, start, end).context("invalid time range")
    }
}

pub async fn cmd_download(config: &TetherConfig, args: DownloadArgs) -> Result<()> {
    let (mut conn, _) = Connection::open(config, super::ingest_sink(config)).await?;
    let statistics = conn.statistics(&args.filename).await?;

    for topic in &args.topics {
        if !statistics.topics().any(|t| t == topic) {
            eprintln!("  warning: {} has no topic {topic}", args.filename);
        }
    }

    let request = args.request(&statistics)?;
    // Relative cache paths land in the configured cache directory.
    let cache = args.cache.as_ref().map(|p| config.transfer.cache_dir.join(p));

    let result = conn.download(request, cache.clone()).await?;
    let sink = conn.close().await?;

    print::banner(&format!("{} ({})", args.filename, result.outcome));
    println!("  Chunks    : {}", result.chunks);
    if let Some(path) = &cache {
        println!("  Cache     : {}", path.display());
    }
    print::series(&sink.store().snapshot());
    if let Some(report) = &result.report {
        print::report(report);
    }
    Ok(())
}
