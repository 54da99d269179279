//! Protocol session: one server process, one JSON-RPC connection.
//!
//! A session owns three background tasks:
//! - the writer, the only task that touches the server's stdin;
//! - the reader, which demultiplexes responses by id and routes server
//!   requests and notifications;
//! - the monitor, which owns the process handle and either observes its exit
//!   or kills it when the session is disposed or dropped.
//!
//! Lifecycle is the [`SessionState`] machine driven through
//! [`SessionState::next`]. Once `Degraded` or `Disposed`, every call fails
//! with [`LspError::SessionDegraded`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use lsp_types::notification::Notification as LspNotification;
use lsp_types::request::Request as LspRequest;
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    LogMessageParams, MessageType, PublishDiagnosticsParams, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, TextDocumentItem, Uri, VersionedTextDocumentIdentifier,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::{MessageReader, MessageWriter};
use crate::diagnostics::DiagnosticsHub;
use crate::error::LspError;
use crate::launcher::{LaunchedServer, ServerProcess};
use crate::protocol::{self, Notification, Request};
use crate::types::{DiagnosticsEvent, SessionKey};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SessionState {
    Starting,
    /// `initialize` sent, response pending.
    Initializing,
    Ready,
    /// The server process exited on its own.
    Degraded,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    BeginHandshake,
    HandshakeComplete,
    ProcessExited,
    Dispose,
}

impl SessionState {
    /// The single transition function. Terminal states never go back to
    /// `Ready`; out-of-order events leave the state unchanged.
    #[must_use]
    pub(crate) fn next(self, transition: Transition) -> Self {
        use SessionState::{Degraded, Disposed, Initializing, Ready, Starting};
        match (self, transition) {
            (Disposed, _) | (_, Transition::Dispose) => Disposed,
            (Degraded, _) | (_, Transition::ProcessExited) => Degraded,
            (Starting, Transition::BeginHandshake) => Initializing,
            (Initializing, Transition::HandshakeComplete) => Ready,
            (state, _) => state,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Degraded | Self::Disposed)
    }
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

enum Incoming {
    Response {
        id: u64,
        body: Value,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

fn parse_incoming(frame: &Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame.get("method").and_then(Value::as_str).map(String::from);
    let is_response = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method) {
        (Some(id), None) if is_response => Some(Incoming::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method)) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Routes inbound frames for one session.
struct Dispatcher {
    server: String,
    pending: PendingMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    hub: Arc<DiagnosticsHub>,
}

impl Dispatcher {
    async fn dispatch(&self, frame: &Value) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!(server = %self.server, "Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            Incoming::Response { id, body } => {
                let waiter = self.pending.lock().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::trace!(server = %self.server, id, "Discarding stale response"),
                }
            }
            Incoming::ServerRequest { id, method, params } => {
                let reply = self.answer_server_request(&id, &method, params.as_ref());
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
            }
        }
    }

    /// Servers block on some of their own requests, so every one gets an
    /// answer.
    fn answer_server_request(&self, id: &Value, method: &str, params: Option<&Value>) -> Value {
        match method {
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => protocol::reply(id, Value::Null),
            "workspace/configuration" => {
                let items = params
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                protocol::reply(id, Value::Array(vec![Value::Null; items]))
            }
            _ => {
                tracing::debug!(server = %self.server, method, "Unsupported server request");
                protocol::reply_error(
                    id,
                    protocol::METHOD_NOT_FOUND,
                    &format!("Method not found: {method}"),
                )
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            lsp_types::notification::PublishDiagnostics::METHOD => {
                let Some(params) = params else {
                    tracing::debug!(server = %self.server, "publishDiagnostics without params");
                    return;
                };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(p) => self.hub.publish(DiagnosticsEvent {
                        uri: p.uri,
                        version: p.version,
                        diagnostics: p.diagnostics,
                    }),
                    Err(e) => {
                        tracing::debug!(server = %self.server, "Dropping malformed diagnostics: {e}");
                    }
                }
            }
            lsp_types::notification::LogMessage::METHOD => {
                let Some(log) = params.and_then(|p| serde_json::from_value::<LogMessageParams>(p).ok())
                else {
                    return;
                };
                if log.typ == MessageType::ERROR {
                    tracing::warn!(server = %self.server, "{}", log.message);
                } else if log.typ == MessageType::WARNING || log.typ == MessageType::INFO {
                    tracing::debug!(server = %self.server, "{}", log.message);
                } else {
                    tracing::trace!(server = %self.server, "{}", log.message);
                }
            }
            _ => tracing::trace!(server = %self.server, method, "Ignoring notification"),
        }
    }
}

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub handshake: Duration,
    pub request: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            request: Duration::from_secs(30),
        }
    }
}

/// A live connection to one language server for one workspace.
pub struct Session {
    key: SessionKey,
    server: String,
    state: Arc<watch::Sender<SessionState>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    /// Open documents and their last sent version. Held across the enqueue
    /// of document notifications so they reach the writer in call order.
    documents: Mutex<HashMap<String, i32>>,
    kill: CancellationToken,
    disposing: AtomicBool,
    timeouts: SessionTimeouts,
}

impl Session {
    /// Wire up a freshly launched server and run the `initialize` handshake.
    ///
    /// On failure the process is killed and nothing is left running.
    pub async fn start(
        key: SessionKey,
        server: &str,
        launched: LaunchedServer,
        hub: Arc<DiagnosticsHub>,
        timeouts: SessionTimeouts,
    ) -> Result<Arc<Self>, LspError> {
        let LaunchedServer {
            stdin,
            stdout,
            process,
        } = launched;

        let (state, _) = watch::channel(SessionState::Starting);
        let state = Arc::new(state);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let kill = CancellationToken::new();

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        tokio::spawn(run_writer(stdin, writer_rx, server.to_string()));

        let dispatcher = Dispatcher {
            server: server.to_string(),
            pending: pending.clone(),
            writer_tx: writer_tx.clone(),
            hub,
        };
        tokio::spawn(run_reader(stdout, dispatcher, state.clone()));
        tokio::spawn(run_monitor(
            process,
            kill.clone(),
            state.clone(),
            server.to_string(),
        ));

        let session = Arc::new(Self {
            key,
            server: server.to_string(),
            state,
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            documents: Mutex::new(HashMap::new()),
            kill,
            disposing: AtomicBool::new(false),
            timeouts,
        });

        if let Err(e) = session.handshake().await {
            session.transition(Transition::Dispose);
            session.kill.cancel();
            return Err(LspError::HandshakeFailed {
                server: server.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(session)
    }

    async fn handshake(&self) -> Result<(), LspError> {
        self.transition(Transition::BeginHandshake);

        let root = self.key.root();
        let root_uri = protocol::path_to_uri(root)?;
        let params = protocol::initialize_params(root, &root_uri);
        let never = CancellationToken::new();
        let result = self
            .call(
                lsp_types::request::Initialize::METHOD,
                Some(params),
                self.timeouts.handshake,
                &never,
            )
            .await?;
        if let Some(name) = result
            .get("serverInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
        {
            tracing::debug!(server = %self.server, reported = name, "Server identified itself");
        }

        self.send_notification(
            lsp_types::notification::Initialized::METHOD,
            Some(serde_json::json!({})),
        )
        .await?;
        self.transition(Transition::HandshakeComplete);
        tracing::info!(server = %self.server, root = %root.display(), "Language server ready");
        Ok(())
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, transition: Transition) {
        self.state.send_if_modified(|state| {
            let next = state.next(transition);
            let changed = next != *state;
            *state = next;
            changed
        });
    }

    fn degraded(&self) -> LspError {
        LspError::SessionDegraded {
            key: self.key.clone(),
        }
    }

    fn ensure_live(&self) -> Result<(), LspError> {
        if self.state().is_terminal() {
            Err(self.degraded())
        } else {
            Ok(())
        }
    }

    /// Typed request. Fails fast unless the session is `Ready`.
    pub async fn request<R>(
        &self,
        params: R::Params,
        cancel: &CancellationToken,
    ) -> Result<R::Result, LspError>
    where
        R: LspRequest,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        if self.state() != SessionState::Ready {
            return Err(self.degraded());
        }
        let params = serde_json::to_value(params)
            .map_err(|e| LspError::request_failed(R::METHOD, e.to_string()))?;
        let result = self
            .call(R::METHOD, Some(params), self.timeouts.request, cancel)
            .await?;
        serde_json::from_value(result).map_err(|e| {
            LspError::request_failed(R::METHOD, format!("unexpected response shape: {e}"))
        })
    }

    /// Send a request and wait for its `result`.
    ///
    /// Gives up on cancellation, timeout, or the session turning terminal.
    /// The pending slot is removed in every case, so a late response is
    /// discarded by the reader.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, LspError> {
        self.ensure_live()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| LspError::request_failed(method, e.to_string()));
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
        };
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(self.degraded());
        }
        tracing::trace!(server = %self.server, method, id, "Request sent");

        let mut state_rx = self.state.subscribe();
        let outcome = tokio::select! {
            biased;
            response = rx => response.map_err(|_| self.degraded()),
            () = cancel.cancelled() => Err(LspError::Cancelled { method: method.to_string() }),
            () = async {
                let _ = state_rx.wait_for(|s| s.is_terminal()).await;
            } => Err(self.degraded()),
            () = tokio::time::sleep(timeout) => Err(LspError::request_failed(
                method,
                format!("no response within {timeout:?}"),
            )),
        };
        if outcome.is_err() {
            self.pending.lock().await.remove(&id);
        }
        let mut body = outcome?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            return Err(LspError::request_failed(
                method,
                format!("{message} (code {code})"),
            ));
        }
        Ok(body
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        self.ensure_live()?;
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| LspError::request_failed(method, e.to_string()))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| self.degraded())
    }

    async fn notify<N>(&self, params: N::Params) -> Result<(), LspError>
    where
        N: LspNotification,
        N::Params: Serialize,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| LspError::request_failed(N::METHOD, e.to_string()))?;
        self.send_notification(N::METHOD, Some(params)).await
    }

    /// `didOpen`, or a full-text `didChange` when the document is already
    /// open.
    pub async fn open_document(
        &self,
        uri: &Uri,
        language_id: &str,
        text: &str,
    ) -> Result<(), LspError> {
        let mut documents = self.documents.lock().await;
        self.ensure_live()?;
        if let Some(version) = documents.get(uri.as_str()).copied() {
            self.send_change(uri, version + 1, text).await?;
            documents.insert(uri.as_str().to_string(), version + 1);
            return Ok(());
        }
        self.notify::<lsp_types::notification::DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version: 1,
                text: text.to_string(),
            },
        })
        .await?;
        documents.insert(uri.as_str().to_string(), 1);
        Ok(())
    }

    /// Full-text `didChange`. A document this session has not seen is
    /// opened instead.
    pub async fn change_document(&self, uri: &Uri, text: &str) -> Result<(), LspError> {
        let mut documents = self.documents.lock().await;
        self.ensure_live()?;
        match documents.get(uri.as_str()).copied() {
            Some(version) => {
                self.send_change(uri, version + 1, text).await?;
                documents.insert(uri.as_str().to_string(), version + 1);
            }
            None => {
                self.notify::<lsp_types::notification::DidOpenTextDocument>(
                    DidOpenTextDocumentParams {
                        text_document: TextDocumentItem {
                            uri: uri.clone(),
                            language_id: self.key.language_id().to_string(),
                            version: 1,
                            text: text.to_string(),
                        },
                    },
                )
                .await?;
                documents.insert(uri.as_str().to_string(), 1);
            }
        }
        Ok(())
    }

    async fn send_change(&self, uri: &Uri, version: i32, text: &str) -> Result<(), LspError> {
        self.notify::<lsp_types::notification::DidChangeTextDocument>(
            DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version,
                },
                content_changes: vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: text.to_string(),
                }],
            },
        )
        .await
    }

    /// `didClose` for an open document; closing an unknown one is a no-op.
    pub async fn close_document(&self, uri: &Uri) -> Result<(), LspError> {
        let mut documents = self.documents.lock().await;
        self.ensure_live()?;
        if documents.remove(uri.as_str()).is_none() {
            return Ok(());
        }
        self.notify::<lsp_types::notification::DidCloseTextDocument>(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        })
        .await
    }

    pub async fn has_document(&self, uri: &Uri) -> bool {
        self.documents.lock().await.contains_key(uri.as_str())
    }

    /// Shut the server down. Idempotent.
    ///
    /// A `Ready` server gets `shutdown` (bounded) and `exit` first; the
    /// process is killed regardless.
    pub async fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.state() == SessionState::Ready {
            let never = CancellationToken::new();
            match self
                .call(
                    lsp_types::request::Shutdown::METHOD,
                    None,
                    SHUTDOWN_TIMEOUT,
                    &never,
                )
                .await
            {
                Ok(_) => {
                    let _ = self
                        .send_notification(lsp_types::notification::Exit::METHOD, None)
                        .await;
                }
                Err(e) => tracing::debug!(server = %self.server, "Graceful shutdown failed: {e}"),
            }
        }

        self.transition(Transition::Dispose);
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        self.kill.cancel();
        self.pending.lock().await.clear();
        tracing::info!(server = %self.server, key = %self.key, "Language server session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn run_writer(
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::Receiver<WriterCommand>,
    server: String,
) {
    let mut writer = MessageWriter::new(stdin);
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    tracing::warn!(server = %server, "Write to language server failed: {e:#}");
                    break;
                }
            }
            WriterCommand::Shutdown => {
                let _ = writer.close().await;
                break;
            }
        }
    }
}

async fn run_reader(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<SessionState>>,
) {
    let mut reader = MessageReader::new(stdout);
    loop {
        match reader.next_message().await {
            Ok(Some(frame)) => dispatcher.dispatch(&frame).await,
            Ok(None) => {
                tracing::debug!(server = %dispatcher.server, "Language server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %dispatcher.server, "Read from language server failed: {e:#}");
                break;
            }
        }
    }
    mark_exited(&state);
    dispatcher.pending.lock().await.clear();
}

async fn run_monitor(
    mut process: Box<dyn ServerProcess>,
    kill: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    server: String,
) {
    let exited = tokio::select! {
        status = process.wait() => Some(status),
        () = kill.cancelled() => None,
    };
    match exited {
        Some(status) => {
            match status {
                Ok(code) => tracing::warn!(server = %server, ?code, "Language server exited"),
                Err(e) => tracing::warn!(server = %server, "Waiting on language server failed: {e}"),
            }
            mark_exited(&state);
        }
        None => {
            if let Err(e) = process.kill().await {
                tracing::debug!(server = %server, "Killing language server failed: {e}");
            }
        }
    }
}

fn mark_exited(state: &watch::Sender<SessionState>) {
    state.send_if_modified(|s| {
        let next = s.next(Transition::ProcessExited);
        let changed = next != *s;
        *s = next;
        changed
    });
}
