//! One smart HTTP service request from body ingestion to response end.
//!
//! A session buffers the request body, recovers negotiation metadata from
//! it, and waits for the embedder to [`accept`](ServiceSession::accept) or
//! [`reject`](ServiceSession::reject). Accepting runs the pack binary with
//! the buffered body on stdin and its stdout relayed to the response.
//! Rejecting writes a report-status message instead. Progress is reported
//! through [`SessionEvent`]s.

use crate::negotiation::{parse_negotiation, Action, Negotiation, RefKind};
use crate::request::{BodyBuffer, RequestHeaders};
use crate::response::{rejection_report, ResponseStream};
use crate::service::{GitCommand, ServiceKind};
use crate::{GitError, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Holds an accepted launch until the embedder's code after `accept` has run.
///
/// Armed by `accept`. Released by the next session or event call that
/// awaits, by awaiting the [`LaunchHandle`], or by dropping the session or
/// its events.
#[derive(Default)]
struct LaunchGate {
    armed: AtomicBool,
    open: Notify,
}

impl LaunchGate {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            // Stores a permit when the launch is not waiting yet.
            self.open.notify_one();
        }
    }

    async fn wait(&self) {
        self.open.notified().await;
    }
}

/// Receiver side of a session's events.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    gate: Arc<LaunchGate>,
}

impl SessionEvents {
    /// Waits for the next event.
    ///
    /// Awaiting this lets an accepted launch proceed. Returns `None` once the
    /// session and its launch are gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.gate.release();
        self.rx.recv().await
    }

    /// Takes an event if one is queued. Never releases a pending launch.
    pub fn try_recv(&mut self) -> std::result::Result<SessionEvent, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for SessionEvents {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Handle to an accepted launch.
///
/// Awaiting it lets the launch proceed and resolves when the pack binary has
/// exited and the response is finalized. Dropping it detaches the launch.
pub struct LaunchHandle {
    task: JoinHandle<()>,
    gate: Arc<LaunchGate>,
}

impl Future for LaunchHandle {
    type Output = std::result::Result<(), JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.gate.release();
        Pin::new(&mut self.task).poll(cx)
    }
}

/// Session behaviour that is not derived from the request.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Pack binary argv prefix; empty selects the platform binary.
    pub git_command: Vec<String>,
    /// Complete a body without `content-length` when the stream ends.
    pub complete_on_eof: bool,
}

/// Decision state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Waiting for accept or reject.
    Pending,
    /// Accepted; the pack binary runs.
    Accepted,
    /// Rejected; a report-status was written.
    Rejected,
}

/// Notifications emitted by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// A negotiation record was parsed from the body.
    Header(Negotiation),
    /// The full decoded body is available.
    Buffer(Bytes),
    /// The pack binary started.
    Service {
        /// Process id, when the platform reports one.
        pid: Option<u32>,
        /// Command line that was run.
        command: String,
    },
    /// The pack binary exited and the response was finalized.
    Exit {
        /// Exit status, if it could be collected.
        status: Option<ExitStatus>,
    },
    /// The pack binary could not be started.
    Error(GitError),
}

/// The parameters identifying a service request.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Repository identifier.
    pub repo: String,
    /// Requested service.
    pub kind: ServiceKind,
    /// Repository directory the pack binary runs against.
    pub cwd: PathBuf,
    /// Relevant request headers.
    pub headers: RequestHeaders,
}

/// A smart HTTP service request.
pub struct ServiceSession<W> {
    repo: String,
    kind: ServiceKind,
    cwd: PathBuf,
    status: SessionStatus,
    username: Option<String>,
    last: Option<String>,
    commit: Option<String>,
    reference: Option<String>,
    branch: Option<String>,
    tag: Option<String>,
    action: Option<Action>,
    buffer: Option<BodyBuffer>,
    declared_length: Option<u64>,
    body: Option<Bytes>,
    held_tx: Option<oneshot::Sender<Bytes>>,
    held_rx: Option<oneshot::Receiver<Bytes>>,
    response: ResponseStream<W>,
    events: mpsc::UnboundedSender<SessionEvent>,
    command: GitCommand,
    complete_on_eof: bool,
    gate: Arc<LaunchGate>,
}

impl<W> ServiceSession<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a session writing its response to `sink`.
    pub fn new(request: ServiceRequest, sink: W, config: SessionConfig) -> (Self, SessionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(LaunchGate::default());
        let (held_tx, held_rx) = oneshot::channel();
        let username = request.headers.basic_username();
        let buffer = BodyBuffer::new(
            request.headers.content_encoding,
            request.headers.content_length,
        );

        let session = Self {
            repo: request.repo,
            kind: request.kind,
            cwd: request.cwd,
            status: SessionStatus::Pending,
            username,
            last: None,
            commit: None,
            reference: None,
            branch: None,
            tag: None,
            action: None,
            buffer: Some(buffer),
            declared_length: request.headers.content_length,
            body: None,
            held_tx: Some(held_tx),
            held_rx: Some(held_rx),
            response: ResponseStream::new(sink),
            events,
            command: GitCommand::new(config.git_command),
            complete_on_eof: config.complete_on_eof,
            gate: Arc::clone(&gate),
        };
        (session, SessionEvents { rx, gate })
    }

    /// Repository identifier.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Requested service.
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Repository directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Decision state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Username from Basic credentials.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Old object id of the last parsed ref update.
    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// New object id of the last ref update, or the requested object.
    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    /// Full name of the last updated ref.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// Branch name when the last ref update targets a branch.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Tag name when the last ref update targets a tag.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Action of the last parsed record.
    pub fn action(&self) -> Option<Action> {
        self.action
    }

    /// The decoded body once buffering completed.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Handle to the response stream.
    pub fn response(&self) -> ResponseStream<W> {
        self.response.clone()
    }

    /// Reads `body` until the declared content length has arrived.
    ///
    /// Returns true once the body is buffered. Returns false if the stream
    /// ended first; the session then never becomes ready and the caller has
    /// to give up on it. Reading stops at completion, so trailing bytes are
    /// left in the stream.
    pub async fn ingest<S, B, E>(&mut self, mut body: S) -> Result<bool>
    where
        S: Stream<Item = std::result::Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.gate.release();
        let eof_completes = self.complete_on_eof && self.declared_length.is_none();
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(self.body.is_some());
        };

        while !buffer.is_complete() {
            match body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| GitError::Body(Box::new(e)))?;
                    buffer.append(chunk.as_ref())?;
                }
                None if eof_completes => buffer.complete_now(),
                None => {
                    debug!(
                        repo = %self.repo,
                        received = buffer.received(),
                        expected = ?self.declared_length,
                        "request body ended before its declared length"
                    );
                    return Ok(false);
                }
            }
        }

        if let Some(buffer) = self.buffer.take() {
            self.buffered(buffer.finish()?);
        }
        Ok(true)
    }

    fn buffered(&mut self, body: Bytes) {
        debug!(repo = %self.repo, service = %self.kind, bytes = body.len(), "request body buffered");
        self.body = Some(body.clone());
        let _ = self.events.send(SessionEvent::Buffer(body.clone()));

        for record in parse_negotiation(self.kind, &body) {
            self.apply(&record);
            let _ = self.events.send(SessionEvent::Header(record));
        }

        if let Some(tx) = self.held_tx.take() {
            let _ = tx.send(body);
        }
    }

    fn apply(&mut self, record: &Negotiation) {
        self.action = Some(record.action());
        match record {
            Negotiation::Push(update) => {
                self.last = Some(update.last.clone());
                self.commit = Some(update.commit.clone());
                self.reference = Some(update.reference.clone());
                match update.kind {
                    RefKind::Branch => self.branch = Some(update.name.clone()),
                    RefKind::Tag => self.tag = Some(update.name.clone()),
                }
                debug!(reference = %update.reference, commit = %update.commit, "parsed ref update");
            }
            Negotiation::Fetch { commit } => {
                self.commit = Some(commit.clone());
                debug!(commit = %commit, "parsed fetch request");
            }
        }
    }

    /// Accepts the request and schedules the pack binary.
    ///
    /// The launch task waits until the caller continues asynchronously: an
    /// awaited session or [`SessionEvents`] call, awaiting the returned
    /// handle, or dropping the session. Code between `accept` and that point
    /// runs before the binary starts, on any runtime flavor. Returns `None`
    /// if the session was already decided.
    pub fn accept(&mut self) -> Option<LaunchHandle> {
        if self.status != SessionStatus::Pending {
            return None;
        }
        self.status = SessionStatus::Accepted;
        info!(
            repo = %self.repo,
            service = %self.kind,
            username = self.username.as_deref().unwrap_or("-"),
            "request accepted"
        );

        let launch = Launch {
            kind: self.kind,
            cwd: self.cwd.clone(),
            command: self.command.clone(),
            response: self.response.clone(),
            events: self.events.clone(),
            held: self.held_rx.take(),
            gate: Arc::clone(&self.gate),
        };
        self.gate.arm();
        Some(LaunchHandle {
            task: tokio::spawn(launch.run()),
            gate: Arc::clone(&self.gate),
        })
    }

    /// Rejects the request with a report-status message.
    ///
    /// Returns false if the session was already decided.
    pub async fn reject(&mut self, message: &str) -> Result<bool> {
        self.gate.release();
        if self.status != SessionStatus::Pending {
            return Ok(false);
        }
        self.status = SessionStatus::Rejected;
        info!(
            repo = %self.repo,
            service = %self.kind,
            username = self.username.as_deref().unwrap_or("-"),
            reason = %message,
            "request rejected"
        );

        self.response
            .relay(&rejection_report(self.reference.as_deref(), message))
            .await?;
        self.response.finalize().await?;
        Ok(true)
    }

    /// Sends a progress line to the client.
    ///
    /// Silently does nothing once the response has ended.
    pub async fn log(&self, message: impl AsRef<str>) -> Result<()> {
        self.gate.release();
        self.response.progress(message.as_ref()).await.map(|_| ())
    }
}

impl<W> Drop for ServiceSession<W> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Everything the spawned pack binary task needs.
struct Launch<W> {
    kind: ServiceKind,
    cwd: PathBuf,
    command: GitCommand,
    response: ResponseStream<W>,
    events: mpsc::UnboundedSender<SessionEvent>,
    held: Option<oneshot::Receiver<Bytes>>,
    gate: Arc<LaunchGate>,
}

impl<W> Launch<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self) {
        let Launch {
            kind,
            cwd,
            command,
            response,
            events,
            held,
            gate,
        } = self;

        gate.wait().await;

        let (mut cmd, line) = command.stateless_rpc(kind, &cwd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(command = %line, error = %source, "failed to start pack binary");
                let _ = events.send(SessionEvent::Error(GitError::Spawn {
                    command: line,
                    source,
                }));
                return;
            }
        };

        let pid = child.id();
        debug!(command = %line, ?pid, "pack binary started");
        let _ = events.send(SessionEvent::Service {
            pid,
            command: line.clone(),
        });

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let feed = async {
            let (Some(mut stdin), Some(held)) = (stdin, held) else {
                return;
            };
            // A dropped sender means the body never completed; stdin just closes.
            if let Ok(body) = held.await {
                if let Err(e) = stdin.write_all(&body).await {
                    warn!(error = %e, "pack binary stopped reading stdin");
                }
            }
        };

        let relay = async {
            let Some(stdout) = stdout else { return };
            if let Err(e) = response.pipe(stdout).await {
                warn!(error = %e, "relaying pack output failed");
            }
        };

        tokio::join!(feed, relay, drain_stderr(stderr));

        let status = match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "failed to collect pack binary status");
                None
            }
        };
        debug!(command = %line, ?status, "pack binary exited");

        if let Err(e) = response.finalize().await {
            debug!(error = %e, "finalizing response failed");
        }
        let _ = events.send(SessionEvent::Exit { status });
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(stderr: Option<R>) {
    let Some(stderr) = stderr else { return };
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                warn!(target: "gitgate_git::pack", "{}", text.trim_end());
            }
            Err(e) => {
                debug!(error = %e, "error reading pack binary stderr");
                // Keep the pipe open so the binary never writes into a closed one.
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!(error = %e, "pack binary stderr closed");
                }
                break;
            }
        }
    }
}
