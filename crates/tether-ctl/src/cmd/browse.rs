//! `files` and `stats`.

use anyhow::Result;

use tether_core::config::TetherConfig;

use super::connection::Connection;
use super::print;

pub async fn cmd_files(config: &TetherConfig) -> Result<()> {
    let (conn, files) = Connection::open(config, super::ingest_sink(config)).await?;
    print::files(&config.server.host, config.server.port, &files);
    conn.close().await?;
    Ok(())
}

pub async fn cmd_stats(config: &TetherConfig, filename: &str) -> Result<()> {
    let (mut conn, _) = Connection::open(config, super::ingest_sink(config)).await?;
    let statistics = conn.statistics(filename).await?;
    print::statistics(filename, &statistics);
    conn.close().await?;
    Ok(())
}
