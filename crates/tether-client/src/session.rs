//! Transfer session state machine.
//!
//! `Session::handle` takes one input (a user command, a transport event or
//! a decoded reply) and returns the actions the driver must perform. The
//! session never touches the network itself, which keeps every transition
//! testable without a server.

use std::fmt;
use std::sync::Arc;

use tether_core::{DataRequest, FileInfo, MessageType, Reply, Request, Statistics};
use tether_ingest::IngestReport;

// ── States ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Progress of the active download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub request: DataRequest,
    /// Advertised by the server. A hint only, never enforced.
    pub expected_chunks: Option<u64>,
    pub chunks_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting { host: String, port: u16 },
    ListingFiles,
    Idle,
    FileSelected { filename: String },
    AwaitingStatistics { filename: String },
    Ready { filename: String },
    Downloading(Transfer),
    CancelRequested(Transfer),
    /// A transfer ended. Accepts everything `Idle` accepts.
    Finished(TransferOutcome),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::ListingFiles => "listing files",
            Self::Idle => "idle",
            Self::FileSelected { .. } => "file selected",
            Self::AwaitingStatistics { .. } => "awaiting statistics",
            Self::Ready { .. } => "ready",
            Self::Downloading(_) => "downloading",
            Self::CancelRequested(_) => "cancel requested",
            Self::Finished(TransferOutcome::Completed) => "completed",
            Self::Finished(TransferOutcome::Cancelled) => "cancelled",
            Self::Finished(TransferOutcome::Failed) => "failed",
        }
    }

    fn is_idle_like(&self) -> bool {
        matches!(self, Self::Idle | Self::Ready { .. } | Self::Finished(_))
    }

    fn transfer(&self) -> Option<&Transfer> {
        match self {
            Self::Downloading(t) | Self::CancelRequested(t) => Some(t),
            _ => None,
        }
    }
}

// ── Inputs, actions, events ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Input {
    Connect { host: String, port: u16 },
    Connected,
    ConnectFailed { reason: String },
    TransportLost { reason: String },
    /// The sink could not start the transfer (e.g. the cache file).
    TransferSetupFailed { reason: String },
    Disconnect,
    ListFiles,
    RequestStatistics(String),
    Download(DataRequest),
    Cancel,
    CancelTimeout,
    Reply(Reply),
}

impl Input {
    fn command_name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::ListFiles => "list files",
            Self::RequestStatistics(_) => "request statistics",
            Self::Download(_) => "download",
            Self::Cancel => "cancel",
            _ => "event",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    OpenTransport { host: String, port: u16 },
    CloseTransport,
    Send(Request),
    Emit(SessionEvent),
    BeginTransfer {
        statistics: Arc<Statistics>,
        request: DataRequest,
    },
    FinishTransfer(TransferOutcome),
    ArmCancelTimer,
}

/// What the session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { host: String, port: u16 },
    Disconnected { reason: String },
    FileList(Vec<FileInfo>),
    Statistics(Arc<Statistics>),
    TransferStarted { expected_chunks: Option<u64> },
    Progress {
        chunk_index: i32,
        chunks_received: u64,
        expected_chunks: Option<u64>,
    },
    TransferFinished {
        outcome: TransferOutcome,
        report: Option<IngestReport>,
    },
    /// `errorMessage` from the server.
    ServerError(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {command} while {state}")]
    InvalidState {
        command: &'static str,
        state: &'static str,
    },

    #[error("no statistics loaded for {0}")]
    NoStatistics(String),
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    /// Last statistics received, with the file they describe.
    statistics: Option<(String, Arc<Statistics>)>,
    host: Option<(String, u16)>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            statistics: None,
            host: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn statistics(&self) -> Option<&Arc<Statistics>> {
        self.statistics.as_ref().map(|(_, s)| s)
    }

    /// Chunk frames are forwarded only while downloading.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self.state, SessionState::Downloading(_))
    }

    /// Count a forwarded chunk. Returns the progress event, or `None` if
    /// the chunk must be discarded.
    pub fn on_chunk(&mut self, chunk_index: i32) -> Option<SessionEvent> {
        let SessionState::Downloading(transfer) = &mut self.state else {
            return None;
        };
        transfer.chunks_received += 1;
        Some(SessionEvent::Progress {
            chunk_index,
            chunks_received: transfer.chunks_received,
            expected_chunks: transfer.expected_chunks,
        })
    }

    fn enter(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = self.state.name(), to = next.name(), "session transition");
        }
        self.state = next;
    }

    fn invalid(&self, input: &Input) -> SessionError {
        SessionError::InvalidState {
            command: input.command_name(),
            state: self.state.name(),
        }
    }

    pub fn handle(&mut self, input: Input) -> Result<Vec<Action>, SessionError> {
        match input {
            Input::Reply(reply) => Ok(self.on_reply(reply)),
            Input::TransportLost { reason } => Ok(self.drop_connection(reason)),
            Input::Disconnect => {
                if self.state == SessionState::Disconnected {
                    return Err(self.invalid(&Input::Disconnect));
                }
                Ok(self.drop_connection("disconnected".to_string()))
            }
            Input::Connect { host, port } => {
                if self.state != SessionState::Disconnected {
                    return Err(self.invalid(&Input::Connect { host, port }));
                }
                self.enter(SessionState::Connecting {
                    host: host.clone(),
                    port,
                });
                Ok(vec![Action::OpenTransport { host, port }])
            }
            Input::Connected => {
                let SessionState::Connecting { host, port } = &self.state else {
                    tracing::debug!(state = self.state.name(), "stray connected event");
                    return Ok(Vec::new());
                };
                let (host, port) = (host.clone(), *port);
                self.host = Some((host.clone(), port));
                self.enter(SessionState::ListingFiles);
                Ok(vec![
                    Action::Emit(SessionEvent::Connected { host, port }),
                    Action::Send(Request::GetFileList),
                ])
            }
            Input::ConnectFailed { reason } => {
                if !matches!(self.state, SessionState::Connecting { .. }) {
                    return Ok(Vec::new());
                }
                self.enter(SessionState::Disconnected);
                Ok(vec![Action::Emit(SessionEvent::Error(format!(
                    "connect failed: {reason}"
                )))])
            }
            Input::ListFiles => {
                if !self.state.is_idle_like() {
                    return Err(self.invalid(&Input::ListFiles));
                }
                self.enter(SessionState::ListingFiles);
                Ok(vec![Action::Send(Request::GetFileList)])
            }
            Input::RequestStatistics(filename) => {
                if !self.state.is_idle_like() {
                    return Err(self.invalid(&Input::RequestStatistics(filename)));
                }
                self.enter(SessionState::FileSelected {
                    filename: filename.clone(),
                });
                self.enter(SessionState::AwaitingStatistics {
                    filename: filename.clone(),
                });
                Ok(vec![Action::Send(Request::GetStatistics { filename })])
            }
            Input::Download(request) => self.start_download(request),
            Input::Cancel => match &self.state {
                SessionState::Downloading(transfer) => {
                    let transfer = transfer.clone();
                    self.enter(SessionState::CancelRequested(transfer));
                    Ok(vec![Action::Send(Request::CancelDownload), Action::ArmCancelTimer])
                }
                SessionState::CancelRequested(_) => Ok(Vec::new()),
                _ => Err(self.invalid(&Input::Cancel)),
            },
            Input::CancelTimeout => {
                if !matches!(self.state, SessionState::CancelRequested(_)) {
                    return Ok(Vec::new());
                }
                tracing::warn!("server did not acknowledge cancel, cancelling locally");
                Ok(self.finish(TransferOutcome::Cancelled))
            }
            Input::TransferSetupFailed { reason } => {
                if self.state.transfer().is_none() {
                    return Ok(Vec::new());
                }
                let mut actions = vec![Action::Emit(SessionEvent::Error(format!(
                    "transfer setup failed: {reason}"
                )))];
                actions.extend(self.finish(TransferOutcome::Failed));
                Ok(actions)
            }
        }
    }

    fn start_download(&mut self, request: DataRequest) -> Result<Vec<Action>, SessionError> {
        if !self.state.is_idle_like() {
            return Err(self.invalid(&Input::Download(request)));
        }
        let statistics = match &self.statistics {
            Some((filename, statistics)) if *filename == request.filename => statistics.clone(),
            _ => return Err(SessionError::NoStatistics(request.filename)),
        };

        self.enter(SessionState::Downloading(Transfer {
            request: request.clone(),
            expected_chunks: None,
            chunks_received: 0,
        }));
        Ok(vec![
            Action::BeginTransfer {
                statistics,
                request: request.clone(),
            },
            Action::Send(Request::DownloadData(request)),
        ])
    }

    fn finish(&mut self, outcome: TransferOutcome) -> Vec<Action> {
        if let Some(transfer) = self.state.transfer() {
            tracing::info!(
                file = %transfer.request.filename,
                chunks = transfer.chunks_received,
                %outcome,
                "transfer finished"
            );
        }
        self.enter(SessionState::Finished(outcome));
        vec![Action::FinishTransfer(outcome)]
    }

    fn drop_connection(&mut self, reason: String) -> Vec<Action> {
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state.transfer().is_some() {
            actions.extend(self.finish(TransferOutcome::Failed));
        }
        actions.push(Action::CloseTransport);
        if let Some((host, port)) = self.host.take() {
            tracing::info!(%host, port, %reason, "disconnected");
        }
        self.statistics = None;
        self.enter(SessionState::Disconnected);
        actions.push(Action::Emit(SessionEvent::Disconnected { reason }));
        actions
    }

    fn on_reply(&mut self, reply: Reply) -> Vec<Action> {
        let kind = reply.kind();
        match reply {
            Reply::FileList(files) => {
                if self.state != SessionState::ListingFiles {
                    return self.ignored(kind);
                }
                self.enter(SessionState::Idle);
                vec![Action::Emit(SessionEvent::FileList(files))]
            }
            Reply::Statistics(statistics) => {
                let SessionState::AwaitingStatistics { filename } = &self.state else {
                    return self.ignored(kind);
                };
                let filename = filename.clone();
                let statistics = Arc::new(statistics);
                self.statistics = Some((filename.clone(), statistics.clone()));
                self.enter(SessionState::Ready { filename });
                vec![Action::Emit(SessionEvent::Statistics(statistics))]
            }
            Reply::DownloadAccepted { chunk_count } | Reply::TransferStarted { chunk_count } => {
                let SessionState::Downloading(transfer) = &mut self.state else {
                    return self.ignored(kind);
                };
                transfer.expected_chunks = u64::try_from(chunk_count).ok();
                vec![Action::Emit(SessionEvent::TransferStarted {
                    expected_chunks: transfer.expected_chunks,
                })]
            }
            Reply::TransferCompleted => match &self.state {
                SessionState::Downloading(transfer) => {
                    if let Some(expected) = transfer.expected_chunks {
                        if expected != transfer.chunks_received {
                            tracing::debug!(
                                expected,
                                received = transfer.chunks_received,
                                "chunk count differs from advertised"
                            );
                        }
                    }
                    self.finish(TransferOutcome::Completed)
                }
                SessionState::CancelRequested(_) => self.finish(TransferOutcome::Cancelled),
                _ => self.ignored(kind),
            },
            Reply::CancelAcknowledged => {
                if !matches!(self.state, SessionState::CancelRequested(_)) {
                    return self.ignored(kind);
                }
                self.finish(TransferOutcome::Cancelled)
            }
            Reply::Error(message) => {
                tracing::warn!(state = self.state.name(), %message, "server error");
                let mut actions = vec![Action::Emit(SessionEvent::ServerError(message))];
                match self.state {
                    SessionState::Downloading(_) | SessionState::CancelRequested(_) => {
                        actions.extend(self.finish(TransferOutcome::Failed));
                    }
                    SessionState::AwaitingStatistics { .. } | SessionState::ListingFiles => {
                        self.enter(SessionState::Idle);
                    }
                    _ => {}
                }
                actions
            }
        }
    }

    fn ignored(&self, kind: MessageType) -> Vec<Action> {
        tracing::debug!(%kind, state = self.state.name(), "reply ignored");
        Vec::new()
    }
}
