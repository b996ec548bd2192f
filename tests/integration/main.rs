//! Tether integration test harness.
//!
//! Each test starts a scripted server on 127.0.0.1 inside the test process
//! and drives a real client against it over TCP. No external services are
//! needed:
//!
//!   cargo test --test integration
//!
//! The server side of every test is a plain async function over a
//! `ServerConn`, so the exact order of frames on the wire is part of the
//! test.

mod cancel;
mod protocol;
mod transfer;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use tether_client::{ClientHandle, IngestSink, SessionEvent, TransferOutcome};
use tether_core::config::TetherConfig;
use tether_core::transport::{self, Frame, FrameKind};
use tether_core::{
    wire, ChannelInfo, ChunkView, DataRequest, FileInfo, MessageView, Reply, Request, Statistics,
};
use tether_ingest::{
    DecoderOptions, DecoderRegistry, IngestReport, IngestionPipeline, SeriesStore,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SECOND: u64 = 1_000_000_000;

// ── Scripted server ───────────────────────────────────────────────────────────

/// Server end of one accepted connection.
pub struct ServerConn {
    stream: TcpStream,
}

impl ServerConn {
    pub async fn recv_request(&mut self) -> Result<Request> {
        let frame = transport::read_frame(&mut self.stream, 1 << 20)
            .await?
            .context("client closed the connection")?;
        if frame.kind != FrameKind::Text {
            bail!("expected a control message, got {:?}", frame.kind);
        }
        Ok(Request::decode(&frame.body)?)
    }

    pub async fn expect(&mut self, expected: Request) -> Result<()> {
        let got = self.recv_request().await?;
        if got != expected {
            bail!("expected {expected:?}, got {got:?}");
        }
        Ok(())
    }

    pub async fn reply(&mut self, reply: Reply) -> Result<()> {
        self.send_text(reply.encode()).await
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        transport::write_frame(&mut self.stream, &Frame::text(text)).await?;
        Ok(())
    }

    pub async fn send_binary(&mut self, body: Vec<u8>) -> Result<()> {
        transport::write_frame(&mut self.stream, &Frame::binary(body)).await?;
        Ok(())
    }

    /// The client asks for the file list as soon as it connects.
    pub async fn serve_file_list(&mut self, files: Vec<FileInfo>) -> Result<()> {
        self.expect(Request::GetFileList).await?;
        self.reply(Reply::FileList(files)).await
    }

    /// Answer one statistics request. Returns the requested file name.
    pub async fn serve_statistics(&mut self, statistics: &Statistics) -> Result<String> {
        match self.recv_request().await? {
            Request::GetStatistics { filename } => {
                self.reply(Reply::Statistics(statistics.clone())).await?;
                Ok(filename)
            }
            other => bail!("expected getStatistics, got {other:?}"),
        }
    }

    pub async fn expect_download(&mut self) -> Result<DataRequest> {
        match self.recv_request().await? {
            Request::DownloadData(request) => Ok(request),
            other => bail!("expected downloadData, got {other:?}"),
        }
    }

    /// Accept a download and announce `chunk_count` chunks.
    pub async fn start_transfer(&mut self, chunk_count: i64) -> Result<DataRequest> {
        let request = self.expect_download().await?;
        self.reply(Reply::DownloadAccepted { chunk_count }).await?;
        self.reply(Reply::TransferStarted { chunk_count }).await?;
        Ok(request)
    }

    /// Read and discard until the client hangs up.
    pub async fn drain_until_closed(&mut self) -> Result<()> {
        loop {
            match transport::read_frame(&mut self.stream, 1 << 20).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Ok(()),
            }
        }
    }
}

pub struct ScriptedServer {
    pub port: u16,
    task: JoinHandle<Result<()>>,
}

impl ScriptedServer {
    /// Listen on an ephemeral port and run `script` on the first
    /// connection.
    pub async fn start<F, Fut>(script: F) -> Result<Self>
    where
        F: FnOnce(ServerConn) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            script(ServerConn { stream }).await
        });
        Ok(Self { port, task })
    }

    /// Wait for the script to end and surface its error.
    pub async fn finish(self) -> Result<()> {
        tokio::time::timeout(EVENT_TIMEOUT, self.task)
            .await
            .context("server script timed out")?
            .context("server script panicked")?
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

pub const RUN1: &str = "run1.log";
pub const IMU: u16 = 1;
pub const STATUS: u16 = 2;

pub fn run1_files() -> Vec<FileInfo> {
    vec![FileInfo {
        name: RUN1.to_string(),
        size_megabytes: 1.5,
        modified: "2024-03-01 09:30".to_string(),
    }]
}

fn channel(id: u16, topic: &str, schema: &str, encoding: &str, count: u64, step: u64) -> ChannelInfo {
    ChannelInfo {
        id,
        topic: topic.to_string(),
        schema_name: schema.to_string(),
        schema_encoding: encoding.to_string(),
        schema_data: Vec::new(),
        message_encoding: encoding.to_string(),
        message_count: count,
        start_time: 0,
        end_time: (count - 1) * step,
    }
}

/// `/imu` (uint32) every 0.5 s and `/status` (string) every 1 s over
/// ten seconds.
pub fn run1_statistics() -> Statistics {
    Statistics {
        library: "tether-test".to_string(),
        profile: "ros2".to_string(),
        message_count: 30,
        start_time: 0,
        end_time: 10 * SECOND,
        channels: vec![
            channel(IMU, "/imu", "Imu", "uint32", 20, SECOND / 2),
            channel(STATUS, "/status", "Status", "string", 10, SECOND),
        ],
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub channel_id: u16,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Recorded {
    pub fn imu(timestamp: u64, value: u32) -> Self {
        Self {
            channel_id: IMU,
            timestamp,
            payload: value.to_le_bytes().to_vec(),
        }
    }

    pub fn status(timestamp: u64, text: &str) -> Self {
        Self {
            channel_id: STATUS,
            timestamp,
            payload: text.as_bytes().to_vec(),
        }
    }
}

/// Every message of `run1.log`, in timestamp order.
pub fn run1_messages() -> Vec<Recorded> {
    let mut messages = Vec::new();
    for i in 0..20u64 {
        let timestamp = i * SECOND / 2;
        messages.push(Recorded::imu(timestamp, i as u32));
        if i % 2 == 0 {
            messages.push(Recorded::status(timestamp, if i < 10 { "armed" } else { "landing" }));
        }
    }
    messages
}

/// Encode `messages` into chunk frames of at most `per_chunk` messages.
pub fn chunk_frames(messages: &[Recorded], per_chunk: usize) -> Vec<Vec<u8>> {
    messages
        .chunks(per_chunk)
        .enumerate()
        .map(|(index, group)| {
            let chunk = ChunkView {
                index: index as i32,
                messages: group
                    .iter()
                    .map(|m| MessageView {
                        channel_id: m.channel_id,
                        timestamp: m.timestamp,
                        payload: &m.payload,
                    })
                    .collect(),
            };
            wire::encode_chunk(&chunk).expect("fixture chunk encodes")
        })
        .collect()
}

pub fn temp_path(name: &str) -> std::path::PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join(format!("tether-it-{}-{}", std::process::id(), id))
        .join(name)
}

// ── Client side ───────────────────────────────────────────────────────────────

pub fn test_config(port: u16) -> TetherConfig {
    let mut config = TetherConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = port;
    config.transfer.cancel_timeout_ms = 300;
    config
}

pub fn new_pipeline() -> IngestionPipeline {
    IngestionPipeline::new(
        Arc::new(DecoderRegistry::with_builtin()),
        SeriesStore::new(),
        DecoderOptions::default(),
    )
}

pub struct TestClient {
    pub handle: ClientHandle,
    pub events: UnboundedReceiver<SessionEvent>,
    pub port: u16,
    task: JoinHandle<IngestSink>,
}

pub fn spawn_client(port: u16) -> TestClient {
    let (handle, events, task) =
        tether_client::spawn(test_config(port), IngestSink::new(new_pipeline()));
    TestClient {
        handle,
        events,
        port,
        task,
    }
}

impl TestClient {
    /// Wait for the first event `pick` accepts. Errors and disconnects
    /// that `pick` does not accept fail the wait.
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(&SessionEvent) -> Option<T>) -> Result<T> {
        loop {
            let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .context("timed out waiting for event")?
                .context("client task stopped")?;
            if let Some(found) = pick(&event) {
                return Ok(found);
            }
            match event {
                SessionEvent::Error(e) => bail!("client error: {e}"),
                SessionEvent::Disconnected { reason } => bail!("disconnected: {reason}"),
                _ => {}
            }
        }
    }

    pub async fn connect(&mut self) -> Result<Vec<FileInfo>> {
        self.handle.connect("127.0.0.1", self.port).await?;
        self.wait_for(|e| match e {
            SessionEvent::FileList(files) => Some(files.clone()),
            _ => None,
        })
        .await
    }

    pub async fn load_statistics(&mut self, filename: &str) -> Result<Arc<Statistics>> {
        self.handle.request_statistics(filename).await?;
        self.wait_for(|e| match e {
            SessionEvent::Statistics(s) => Some(s.clone()),
            _ => None,
        })
        .await
    }

    pub async fn finished(&mut self) -> Result<(TransferOutcome, Option<IngestReport>)> {
        self.wait_for(|e| match e {
            SessionEvent::TransferFinished { outcome, report } => Some((*outcome, report.clone())),
            _ => None,
        })
        .await
    }

    /// Stop the client task and take back its sink.
    pub async fn stop(self) -> Result<IngestSink> {
        self.handle.shutdown();
        tokio::time::timeout(EVENT_TIMEOUT, self.task)
            .await
            .context("client task did not stop")?
            .context("client task panicked")
    }
}
