//! `replay`: re-ingest a local cache file without a server.

use std::path::Path;

use anyhow::{Context, Result};

use tether_core::config::TetherConfig;
use tether_ingest::CacheReader;

use super::print;

pub fn cmd_replay(config: &TetherConfig, path: &Path) -> Result<()> {
    let reader =
        CacheReader::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let contents = reader
        .read_all()
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut pipeline = super::pipeline(config);
    let report = contents.replay_into(&mut pipeline);

    print::statistics(&contents.filename, &contents.statistics);
    print::series(&pipeline.store().snapshot());
    print::report(&report);
    Ok(())
}
