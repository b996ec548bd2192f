//! Async driver for a `Session`.
//!
//! One task owns the connection, the session and the sink. Commands arrive
//! over an mpsc channel; events leave over another. A separate reader task
//! pulls frames off the socket so that the main `select!` loop only waits
//! on channels and timers.

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tether_core::config::TetherConfig;
use tether_core::transport::{self, Frame, FrameKind};
use tether_core::{wire, DataRequest, Reply};

use crate::session::{Action, Input, Session, SessionError, SessionEvent};
use crate::sink::TransferSink;

/// Frames buffered between the reader task and the driver.
const FRAME_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("client task has stopped")]
    Closed,
}

enum Command {
    Apply {
        input: Input,
        cache: Option<PathBuf>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

/// Cheap, cloneable handle to a running client task.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    async fn apply(&self, input: Input, cache: Option<PathBuf>) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply {
                input,
                cache,
                reply,
            })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)??;
        Ok(())
    }

    /// Returns once the connection attempt has finished; watch the events
    /// for the outcome.
    pub async fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), ClientError> {
        self.apply(
            Input::Connect {
                host: host.into(),
                port,
            },
            None,
        )
        .await
    }

    pub async fn list_files(&self) -> Result<(), ClientError> {
        self.apply(Input::ListFiles, None).await
    }

    pub async fn request_statistics(&self, filename: impl Into<String>) -> Result<(), ClientError> {
        self.apply(Input::RequestStatistics(filename.into()), None).await
    }

    /// Start a download. With `cache`, every forwarded message is also
    /// written to that file.
    pub async fn download(
        &self,
        request: DataRequest,
        cache: Option<PathBuf>,
    ) -> Result<(), ClientError> {
        self.apply(Input::Download(request), cache).await
    }

    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.apply(Input::Cancel, None).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.apply(Input::Disconnect, None).await
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Start a client task.
pub fn spawn<S: TransferSink>(
    config: TetherConfig,
    sink: S,
) -> (
    ClientHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<S>,
) {
    let (tx, commands) = mpsc::unbounded_channel();
    let (events, event_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        config,
        session: Session::new(),
        sink,
        events,
        writer: None,
        frames: None,
        reader: None,
        cancel_deadline: None,
        pending_cache: None,
    };
    let task = tokio::spawn(driver.run(commands));
    (ClientHandle { tx }, event_rx, task)
}

/// What the reader task hands to the driver.
type ReaderItem = Result<Frame, String>;

struct Driver<S> {
    config: TetherConfig,
    session: Session,
    sink: S,
    events: mpsc::UnboundedSender<SessionEvent>,
    writer: Option<OwnedWriteHalf>,
    frames: Option<mpsc::Receiver<ReaderItem>>,
    reader: Option<JoinHandle<()>>,
    cancel_deadline: Option<Instant>,
    pending_cache: Option<PathBuf>,
}

impl<S: TransferSink> Driver<S> {
    /// Runs until shutdown or until every handle is dropped. Returns the
    /// sink so callers can inspect what it collected.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> S {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Apply { input, cache, reply }) => {
                        self.pending_cache = cache;
                        let result = self.apply(input).await;
                        self.pending_cache = None;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },

                item = next_frame(&mut self.frames) => match item {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(reason)) => {
                        self.frames = None;
                        let _ = self.apply(Input::TransportLost { reason }).await;
                    }
                    None => {
                        self.frames = None;
                        let _ = self
                            .apply(Input::TransportLost { reason: "reader stopped".into() })
                            .await;
                    }
                },

                _ = sleep_until(self.cancel_deadline) => {
                    self.cancel_deadline = None;
                    let _ = self.apply(Input::CancelTimeout).await;
                }
            }
        }

        if self.writer.is_some() {
            let _ = self.apply(Input::Disconnect).await;
        }
        tracing::debug!("client task stopped");
        self.sink
    }

    /// Feed one input through the session and perform the resulting
    /// actions. An action that produces a follow-up input (connect result,
    /// send failure) skips the rest of its batch; the follow-up is handled
    /// next. Only the first input's rejection is returned to the caller.
    async fn apply(&mut self, input: Input) -> Result<(), SessionError> {
        let mut queue = VecDeque::from([input]);
        let mut first = true;

        while let Some(input) = queue.pop_front() {
            let actions = match self.session.handle(input) {
                Ok(actions) => actions,
                Err(e) if first => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "follow-up input rejected");
                    continue;
                }
            };
            first = false;

            for action in actions {
                if let Some(follow_up) = self.perform(action).await {
                    queue.push_back(follow_up);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn perform(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::OpenTransport { host, port } => {
                tracing::info!(%host, port, "connecting");
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(stream) => {
                        self.attach(stream);
                        Some(Input::Connected)
                    }
                    Err(e) => Some(Input::ConnectFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            Action::CloseTransport => {
                self.detach();
                None
            }
            Action::Send(request) => {
                let Some(writer) = self.writer.as_mut() else {
                    return Some(Input::TransportLost {
                        reason: "not connected".into(),
                    });
                };
                tracing::debug!(kind = %request.kind(), "sending request");
                match transport::write_frame(writer, &Frame::text(request.encode())).await {
                    Ok(()) => None,
                    Err(e) => Some(Input::TransportLost {
                        reason: e.to_string(),
                    }),
                }
            }
            Action::Emit(event) => {
                self.emit(event);
                None
            }
            Action::BeginTransfer {
                statistics,
                request,
            } => {
                let cache = self.pending_cache.take();
                match self.sink.begin(&statistics, &request, cache.as_deref()) {
                    Ok(()) => None,
                    Err(e) => Some(Input::TransferSetupFailed {
                        reason: format!("{e:#}"),
                    }),
                }
            }
            Action::FinishTransfer(outcome) => {
                self.cancel_deadline = None;
                let report = self.sink.finish(outcome);
                self.emit(SessionEvent::TransferFinished { outcome, report });
                None
            }
            Action::ArmCancelTimer => {
                self.cancel_deadline = Some(Instant::now() + self.config.transfer.cancel_timeout());
                None
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame.kind {
            FrameKind::Text => match Reply::decode(&frame.body) {
                Ok(reply) => {
                    if let Err(e) = self.apply(Input::Reply(reply)).await {
                        tracing::warn!(error = %e, "reply rejected");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "control message ignored"),
            },
            FrameKind::Binary => {
                if !self.session.accepts_chunks() {
                    tracing::debug!(
                        len = frame.body.len(),
                        state = self.session.state().name(),
                        "chunk dropped"
                    );
                    return;
                }
                let chunk = match wire::decode_chunk(&frame.body) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "corrupt chunk frame discarded");
                        return;
                    }
                };
                self.sink.chunk(&chunk);
                if let Some(progress) = self.session.on_chunk(chunk.index) {
                    self.emit(progress);
                }
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }

    fn attach(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let max_frame_bytes = self.config.transfer.max_frame_bytes;

        self.reader = Some(tokio::spawn(async move {
            loop {
                let item = match transport::read_frame(&mut read_half, max_frame_bytes).await {
                    Ok(Some(frame)) => Ok(frame),
                    Ok(None) => Err("connection closed by server".to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let done = item.is_err();
                if tx.send(item).await.is_err() || done {
                    break;
                }
            }
        }));
        self.writer = Some(write_half);
        self.frames = Some(rx);
    }

    fn detach(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.frames = None;
        self.cancel_deadline = None;
    }
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<ReaderItem>>) -> Option<ReaderItem> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
