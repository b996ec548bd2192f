//! Blocking-style wrapper over the client's command/event channels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use tether_client::{ClientHandle, IngestSink, SessionEvent, TransferOutcome};
use tether_core::config::TetherConfig;
use tether_core::{DataRequest, FileInfo, Statistics};
use tether_ingest::IngestReport;

pub struct Connection {
    handle: ClientHandle,
    events: UnboundedReceiver<SessionEvent>,
    task: JoinHandle<IngestSink>,
}

/// How a download ended, as seen from the CLI.
pub struct DownloadResult {
    pub outcome: TransferOutcome,
    pub report: Option<IngestReport>,
    pub chunks: u64,
}

impl Connection {
    /// Connect and wait for the initial file list.
    pub async fn open(config: &TetherConfig, sink: IngestSink) -> Result<(Self, Vec<FileInfo>)> {
        let (handle, events, task) = tether_client::spawn(config.clone(), sink);
        let mut conn = Self {
            handle,
            events,
            task,
        };
        conn.handle
            .connect(config.server.host.clone(), config.server.port)
            .await?;

        let files = loop {
            match conn.next_event().await? {
                SessionEvent::FileList(files) => break files,
                SessionEvent::Connected { host, port } => {
                    tracing::debug!(%host, port, "connected");
                }
                other => conn.fail_on(other)?,
            }
        };
        Ok((conn, files))
    }

    pub async fn statistics(&mut self, filename: &str) -> Result<Arc<Statistics>> {
        self.handle.request_statistics(filename).await?;
        loop {
            match self.next_event().await? {
                SessionEvent::Statistics(statistics) => return Ok(statistics),
                other => self.fail_on(other)?,
            }
        }
    }

    /// Run a download to the end. Ctrl-C cancels it.
    pub async fn download(
        &mut self,
        request: DataRequest,
        cache: Option<PathBuf>,
    ) -> Result<DownloadResult> {
        self.handle.download(request, cache).await?;

        let mut chunks = 0;
        let mut cancelling = false;
        loop {
            let event = tokio::select! {
                event = self.events.recv() => event.context("client task stopped")?,
                _ = tokio::signal::ctrl_c(), if !cancelling => {
                    eprintln!("\n  cancelling…");
                    cancelling = true;
                    self.request_cancel().await;
                    continue;
                }
            };
            match event {
                SessionEvent::TransferStarted { expected_chunks } => {
                    tracing::info!(?expected_chunks, "transfer started");
                }
                SessionEvent::Progress {
                    chunks_received,
                    expected_chunks,
                    ..
                } => {
                    chunks = chunks_received;
                    match expected_chunks {
                        Some(total) => eprint!("\r  chunks: {chunks_received}/{total}"),
                        None => eprint!("\r  chunks: {chunks_received}"),
                    }
                }
                SessionEvent::TransferFinished { outcome, report } => {
                    eprintln!();
                    return Ok(DownloadResult {
                        outcome,
                        report,
                        chunks,
                    });
                }
                SessionEvent::ServerError(message) => {
                    eprintln!("\n  server error: {message}");
                }
                other => self.fail_on(other)?,
            }
        }
    }

    /// Disconnect and hand back the sink.
    pub async fn close(self) -> Result<IngestSink> {
        if let Err(e) = self.handle.disconnect().await {
            tracing::debug!(error = %e, "disconnect");
        }
        self.handle.shutdown();
        self.task.await.context("client task panicked")
    }

    /// Ask the session to cancel. The transfer may already be over, in
    /// which case the finish event is still on its way.
    async fn request_cancel(&self) {
        if let Err(e) = self.handle.cancel().await {
            tracing::debug!(error = %e, "cancel not applied");
        }
    }

    async fn next_event(&mut self) -> Result<SessionEvent> {
        self.events.recv().await.context("client task stopped")
    }

    /// Turn terminal events into errors; log everything else.
    fn fail_on(&self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Error(message) => bail!("{message}"),
            SessionEvent::ServerError(message) => bail!("server error: {message}"),
            SessionEvent::Disconnected { reason } => bail!("disconnected: {reason}"),
            other => {
                tracing::debug!(event = ?other, "event ignored");
                Ok(())
            }
        }
    }
}
