//! Backend instance: one live LSP process and its JSON-RPC channel

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::collector::{DiagnosticCollector, DiagnosticWaiter};
use super::launcher::BackendIo;
use super::protocol::{
    ClientCapabilities, ClientInfo, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, InitializeParams, InitializeResult, LogMessageParams, Message,
    MessageType, Notification, PublishDiagnosticsParams, Request, RequestId, Response,
    ResponseError, TextDocumentClientCapabilities, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, TextDocumentItem, VersionedTextDocumentIdentifier,
    WorkspaceClientCapabilities, WorkspaceFolder, error_codes,
};
use super::registry::BackendConfig;
use super::transport::{
    BoxedReader, BoxedWriter, Transport, write_notification, write_request, write_response,
};
use crate::config::RuntimeConfig;
use crate::error::LspError;
use crate::models::lsp::path_to_uri;

type PendingRequest = oneshot::Sender<Response>;

/// One frame queued for the backend's stdin
#[derive(Debug)]
enum Outgoing {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(2);
const EXIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    NotStarted = 0,
    Starting = 1,
    Initialized = 2,
    Ready = 3,
    Degraded = 4,
    Terminated = 5,
}

impl BackendState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Initialized,
            3 => Self::Ready,
            4 => Self::Degraded,
            5 => Self::Terminated,
            _ => Self::NotStarted,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_usable(self) -> bool {
        self == Self::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Initialized => "initialized",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct OpenDocument {
    version: i32,
    ref_count: u32,
}

/// One document registration made by [`BackendInstance::open_document`]
pub struct OpenedDocument {
    pub version: i32,
    pub waiter: DiagnosticWaiter,
}

pub struct BackendInstance {
    config: BackendConfig,
    runtime: RuntimeConfig,
    roots: Vec<PathBuf>,
    state: AtomicU8,
    process: Mutex<Option<Child>>,
    /// Frames are written by a dedicated task so a cancelled caller can
    /// never leave half a frame on the backend's stdin
    outgoing: std::sync::Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    writer_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    pending: RwLock<HashMap<RequestId, PendingRequest>>,
    documents: Mutex<HashMap<String, OpenDocument>>,
    collector: DiagnosticCollector,
    capabilities: RwLock<Option<InitializeResult>>,
}

impl BackendInstance {
    pub fn new(config: BackendConfig, runtime: RuntimeConfig, roots: Vec<PathBuf>) -> Arc<Self> {
        let collector = DiagnosticCollector::new(runtime.retention);
        Arc::new(Self {
            config,
            runtime,
            roots,
            state: AtomicU8::new(BackendState::NotStarted.to_u8()),
            process: Mutex::new(None),
            outgoing: std::sync::Mutex::new(None),
            writer_task: std::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: RwLock::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            collector,
            capabilities: RwLock::new(None),
        })
    }

    pub fn command(&self) -> String {
        self.config.display_command()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BackendState) {
        let previous = BackendState::from_u8(self.state.swap(state.to_u8(), Ordering::AcqRel));
        if previous != state {
            tracing::debug!("{}: {} -> {}", self.command(), previous, state);
        }
    }

    /// Transition `from -> to`, failing if the reader task got there first
    fn advance(&self, from: BackendState, to: BackendState) -> Result<(), LspError> {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| tracing::debug!("{}: {} -> {}", self.command(), from, to))
            .map_err(|_| LspError::ServerTerminated {
                command: self.command(),
            })
    }

    /// Move to `Degraded` unless already terminated
    fn mark_degraded(&self, reason: &str) {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match BackendState::from_u8(current) {
                    BackendState::Terminated | BackendState::Degraded => None,
                    _ => Some(BackendState::Degraded.to_u8()),
                }
            });
        if result.is_ok() {
            tracing::warn!("{} degraded: {}", self.command(), reason);
        }
    }

    /// Attach to a launched backend and run the initialize handshake
    pub async fn start(self: &Arc<Self>, io: BackendIo) -> Result<(), LspError> {
        self.set_state(BackendState::Starting);

        *self.process.lock().await = io.child;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(Arc::downgrade(self), io.writer, rx));
        *self
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(writer);

        tokio::spawn(read_loop(Arc::downgrade(self), Transport::new(io.reader)));

        self.initialize().await?;

        tracing::info!("{} ready", self.command());
        Ok(())
    }

    async fn initialize(&self) -> Result<(), LspError> {
        let folders: Vec<WorkspaceFolder> = self
            .roots
            .iter()
            .map(|root| WorkspaceFolder {
                uri: path_to_uri(root),
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| root.display().to_string()),
            })
            .collect();

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: self.roots.first().map(|r| path_to_uri(r)),
            capabilities: Self::client_capabilities(),
            client_info: Some(ClientInfo {
                name: "langcheck".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            workspace_folders: (!folders.is_empty()).then_some(folders),
        };

        let result: InitializeResult = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;

        if let Some(info) = &result.server_info {
            tracing::debug!(
                "{} identifies as {} {}",
                self.command(),
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        }
        *self.capabilities.write().await = Some(result);
        self.advance(BackendState::Starting, BackendState::Initialized)?;

        self.notify("initialized", Some(serde_json::json!({})))
            .await?;
        self.advance(BackendState::Initialized, BackendState::Ready)
    }

    /// Capabilities of a client that only syncs documents and reads diagnostics
    fn client_capabilities() -> ClientCapabilities {
        ClientCapabilities {
            text_document: Some(TextDocumentClientCapabilities {
                synchronization: Some(serde_json::json!({
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                })),
                publish_diagnostics: Some(serde_json::json!({
                    "relatedInformation": false,
                    "versionSupport": true,
                    "codeDescriptionSupport": false,
                    "dataSupport": false
                })),
            }),
            workspace: Some(WorkspaceClientCapabilities {
                workspace_folders: Some(true),
                configuration: Some(true),
            }),
            window: Some(serde_json::json!({ "workDoneProgress": true })),
        }
    }

    /// Send a request and wait for response
    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, LspError> {
        match self.state() {
            BackendState::NotStarted => return Err(LspError::NotConnected),
            BackendState::Degraded | BackendState::Terminated => {
                return Err(LspError::ServerTerminated {
                    command: self.command(),
                });
            }
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(RequestId::Number(id), tx);

        let request = Request::new(id, method, params);
        tracing::trace!("{} request {}: {}", self.command(), id, method);

        if let Err(e) = self.send(Outgoing::Request(request)) {
            self.pending.write().await.remove(&RequestId::Number(id));
            return Err(e);
        }

        match timeout(self.runtime.timeout_for(method), rx).await {
            Ok(Ok(response)) => match response.into_result() {
                Ok(result) => {
                    serde_json::from_value(result).map_err(|e| LspError::Protocol(e.to_string()))
                }
                Err(err) if err.code == error_codes::SERVER_TERMINATED => {
                    Err(LspError::ServerTerminated {
                        command: self.command(),
                    })
                }
                Err(err) => Err(err.into()),
            },
            Ok(Err(_)) => Err(LspError::RequestCancelled),
            Err(_) => {
                self.cancel_request(id).await;
                self.mark_degraded(&format!("'{}' timed out", method));
                Err(LspError::Timeout(format!(
                    "{} '{}' timed out. The backend may be busy or unresponsive",
                    self.command(),
                    method
                )))
            }
        }
    }

    async fn cancel_request(&self, id: u64) {
        self.pending.write().await.remove(&RequestId::Number(id));
        let _ = self
            .notify("$/cancelRequest", Some(serde_json::json!({ "id": id })))
            .await;
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        self.send(Outgoing::Notification(Notification::new(method, params)))
    }

    /// Queue a frame for the writer task
    fn send(&self, frame: Outgoing) -> Result<(), LspError> {
        let outgoing = self
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outgoing.as_ref() else {
            return Err(LspError::NotConnected);
        };
        if tx.send(frame).is_err() {
            drop(outgoing);
            self.mark_degraded("writer closed");
            return Err(LspError::ServerTerminated {
                command: self.command(),
            });
        }
        Ok(())
    }

    /// Open `uri` (or bump its version if already open) and register a
    /// diagnostics waiter for the new version.
    ///
    /// The waiter is registered before the notification goes out. Nothing
    /// after the `documents` lock is awaited, so a cancelled caller either
    /// never registered or completed the whole open.
    pub async fn open_document(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<OpenedDocument, LspError> {
        let mut documents = self.documents.lock().await;

        let (version, reopen) = match documents.get(uri) {
            Some(doc) => (doc.version + 1, true),
            None => (1, false),
        };

        // Dropping the waiter on any error path below releases it
        let waiter = if reopen {
            self.collector.register_change(uri, version)
        } else {
            self.collector.register_open(uri, version)
        };

        if reopen {
            let params = DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.to_string(),
                    version,
                },
                content_changes: vec![TextDocumentContentChangeEvent {
                    text: text.to_string(),
                }],
            };
            self.send(Outgoing::Notification(Notification::new(
                "textDocument/didChange",
                Some(serde_json::to_value(params)?),
            )))?;
        } else {
            let params = DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: uri.to_string(),
                    language_id: language_id.to_string(),
                    version,
                    text: text.to_string(),
                },
            };
            self.send(Outgoing::Notification(Notification::new(
                "textDocument/didOpen",
                Some(serde_json::to_value(params)?),
            )))?;
        }

        documents
            .entry(uri.to_string())
            .and_modify(|doc| {
                doc.version = version;
                doc.ref_count += 1;
            })
            .or_insert(OpenDocument {
                version,
                ref_count: 1,
            });

        Ok(OpenedDocument { version, waiter })
    }

    /// Release one reference to `uri`; sends didClose when it was the last.
    ///
    /// Returns whether didClose was sent. The diagnostics registration is
    /// released separately, when its waiter is dropped.
    pub async fn close_document(&self, uri: &str) -> bool {
        let mut documents = self.documents.lock().await;

        let last = match documents.get_mut(uri) {
            Some(doc) => {
                doc.ref_count = doc.ref_count.saturating_sub(1);
                doc.ref_count == 0
            }
            None => false,
        };

        let mut sent = false;
        if last {
            documents.remove(uri);
            let params = DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier::new(uri),
            };
            match serde_json::to_value(params) {
                Ok(params) => match self.notify("textDocument/didClose", Some(params)).await {
                    Ok(()) => sent = true,
                    Err(e) => tracing::debug!("didClose for {} not delivered: {}", uri, e),
                },
                Err(e) => tracing::warn!("Failed to encode didClose for {}: {}", uri, e),
            }
        }
        sent
    }

    pub async fn document_version(&self, uri: &str) -> Option<i32> {
        self.documents.lock().await.get(uri).map(|d| d.version)
    }

    pub async fn open_document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// True when the instance can take new work
    pub async fn is_healthy(&self) -> bool {
        if !self.state().is_usable() {
            return false;
        }
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    pub async fn capabilities(&self) -> Option<InitializeResult> {
        self.capabilities.read().await.clone()
    }

    /// Shutdown the backend with 3-stage graceful termination
    pub async fn shutdown(&self) {
        let previous = self.state();
        if previous == BackendState::Terminated {
            return;
        }

        // Stage 1: shutdown request and exit notification, only if the
        // backend is still answering
        if matches!(previous, BackendState::Ready | BackendState::Initialized) {
            let graceful = timeout(GRACEFUL_SHUTDOWN, async {
                if self.request::<Value>("shutdown", None).await.is_ok() {
                    let _ = self.notify("exit", None).await;
                }
            })
            .await;
            if graceful.is_err() {
                tracing::debug!("{} shutdown request timed out", self.command());
            }
        }

        self.set_state(BackendState::Terminated);

        // Close stdin to signal EOF once queued frames (exit) are flushed
        drop(
            self.outgoing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let writer = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer
            && timeout(GRACEFUL_SHUTDOWN, writer).await.is_err()
        {
            tracing::debug!("{} stdin did not drain in time", self.command());
        }

        // Stage 2 & 3: Wait for process exit, then force kill
        if let Some(mut child) = self.process.lock().await.take() {
            match timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("{} exited: {:?}", self.command(), status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("{} wait error: {}", self.command(), e);
                }
                Err(_) => {
                    tracing::warn!("{} did not exit in time, forcing kill", self.command());
                    let _ = child.kill().await;
                }
            }
        }

        self.fail_pending(error_codes::REQUEST_CANCELLED, "Backend shutdown")
            .await;
        self.collector.disconnect();
        tracing::info!("{} stopped", self.command());
    }

    async fn fail_pending(&self, code: i32, reason: &str) {
        let mut pending = self.pending.write().await;
        if pending.is_empty() {
            return;
        }
        tracing::debug!(
            "Failing {} pending request(s) on {}: {}",
            pending.len(),
            self.command(),
            reason
        );
        for (id, sender) in pending.drain() {
            let _ = sender.send(Response::failure(Some(id), ResponseError::new(code, reason)));
        }
    }

    /// Reader task hit end of stream or a bad frame
    async fn on_stream_lost(&self, error: std::io::Error) {
        if self.state() == BackendState::Terminated {
            return;
        }
        if error.kind() == std::io::ErrorKind::InvalidData {
            let err = LspError::Malformed(error.to_string());
            self.mark_degraded(&err.to_string());
        } else {
            self.mark_degraded(&format!("stream closed ({})", error));
        }
        self.fail_pending(
            error_codes::SERVER_TERMINATED,
            "Backend terminated unexpectedly",
        )
        .await;
        self.collector.disconnect();
    }

    /// Writer task could not deliver a frame
    async fn on_write_failed(&self, error: std::io::Error) {
        if self.state() == BackendState::Terminated {
            return;
        }
        self.mark_degraded(&format!("write failed: {}", error));
        self.fail_pending(
            error_codes::SERVER_TERMINATED,
            "Backend stopped reading its input",
        )
        .await;
        self.collector.disconnect();
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let Some(id) = response.id.clone() else {
                    tracing::debug!("{} sent a response without id", self.command());
                    return;
                };
                let mut pending = self.pending.write().await;
                // Some servers echo numeric ids back as strings
                let sender = pending.remove(&id).or_else(|| match &id {
                    RequestId::String(s) => s
                        .parse::<u64>()
                        .ok()
                        .and_then(|n| pending.remove(&RequestId::Number(n))),
                    RequestId::Number(_) => None,
                });
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(
                            "Received response for unknown request ID {:?} (may have timed out)",
                            id
                        );
                    }
                }
            }
            Message::Request(request) => self.handle_server_request(request).await,
            Message::Notification(notification) => {
                self.handle_notification(notification).await
            }
        }
    }

    async fn handle_notification(&self, notification: Notification) {
        let params = notification.params.unwrap_or(Value::Null);
        match notification.method.as_str() {
            "textDocument/publishDiagnostics" => {
                let uri = params.get("uri").and_then(Value::as_str).map(str::to_string);
                let version = params
                    .get("version")
                    .and_then(Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok());
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => self.collector.publish(params),
                    Err(e) => {
                        tracing::warn!("{} sent unreadable diagnostics: {}", self.command(), e);
                        if let Some(uri) = uri {
                            self.collector.reject(&uri, version, &e.to_string());
                        }
                    }
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Ok(log) = serde_json::from_value::<LogMessageParams>(params) {
                    let name = self.command();
                    match log.typ {
                        MessageType::Error => tracing::error!("{}: {}", name, log.message),
                        MessageType::Warning => tracing::warn!("{}: {}", name, log.message),
                        MessageType::Info => tracing::info!("{}: {}", name, log.message),
                        MessageType::Log => tracing::debug!("{}: {}", name, log.message),
                    }
                }
            }
            method => tracing::trace!("Unhandled notification: {}", method),
        }
    }

    async fn handle_server_request(&self, request: Request) {
        let result = match request.method.as_str() {
            "workspace/configuration" => Ok(Self::workspace_configuration(&request.params)),
            "workspace/workspaceFolders" => Ok(serde_json::json!(
                self.roots
                    .iter()
                    .map(|r| serde_json::json!({
                        "uri": path_to_uri(r),
                        "name": r.file_name().map(|n| n.to_string_lossy().into_owned()),
                    }))
                    .collect::<Vec<_>>()
            )),
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => Ok(Value::Null),
            _ => {
                tracing::debug!("Unhandled backend request: {}", request.method);
                Err(ResponseError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", request.method),
                ))
            }
        };

        let response = match result {
            Ok(value) => Response::success(request.id, value),
            Err(error) => Response::failure(Some(request.id), error),
        };

        if let Err(e) = self.send(Outgoing::Response(response)) {
            tracing::debug!("Failed to answer {}: {}", request.method, e);
        }
    }

    /// One empty settings object per requested item
    fn workspace_configuration(params: &Option<Value>) -> Value {
        let items = params
            .as_ref()
            .and_then(|p| p.get("items"))
            .and_then(|i| i.as_array())
            .map(|arr| arr.len())
            .unwrap_or(0);

        Value::Array(vec![Value::Object(serde_json::Map::new()); items])
    }
}

/// Background task that reads and dispatches backend messages.
///
/// Holds only a weak reference so dropping the instance ends the task.
async fn read_loop(instance: Weak<BackendInstance>, mut transport: Transport<BoxedReader>) {
    loop {
        let result = transport.read_message().await;
        let Some(instance) = instance.upgrade() else {
            break;
        };
        match result {
            Ok(message) => instance.handle_message(message).await,
            Err(e) => {
                instance.on_stream_lost(e).await;
                break;
            }
        }
    }
}

/// Background task that owns the backend's stdin.
///
/// Ends when every sender is gone, closing stdin after the queued frames.
async fn write_loop(
    instance: Weak<BackendInstance>,
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(frame) = rx.recv().await {
        let written = match &frame {
            Outgoing::Request(request) => write_request(&mut writer, request).await,
            Outgoing::Notification(notification) => {
                write_notification(&mut writer, notification).await
            }
            Outgoing::Response(response) => write_response(&mut writer, response).await,
        };
        if let Err(e) = written {
            if let Some(instance) = instance.upgrade() {
                instance.on_write_failed(e).await;
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

impl Drop for BackendInstance {
    fn drop(&mut self) {
        if let Ok(mut process) = self.process.try_lock() {
            if let Some(child) = process.as_mut() {
                let _ = child.start_kill();
                tracing::debug!("{} dropped, process killed", self.config.display_command());
            }
        } else {
            tracing::warn!(
                "{} dropped but could not acquire lock - potential zombie process",
                self.config.display_command()
            );
        }
    }
}
