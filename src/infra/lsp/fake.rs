//! In-process LSP backend for tests, wired through [`BackendLauncher`]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, DuplexStream};

use super::launcher::{BackendIo, BackendLauncher};
use super::protocol::{Message, Notification, Request, RequestId, Response};
use super::registry::BackendConfig;
use super::transport::{Transport, write_notification, write_request, write_response};
use crate::error::LspError;

/// How the fake backend behaves once connected
#[derive(Debug, Clone)]
pub(crate) enum FakeBackend {
    /// Completes the handshake, never publishes
    Clean,
    /// Publishes these diagnostics for every didOpen/didChange
    Publish(Vec<Value>),
    /// Never answers initialize
    Silent,
    /// Closes its end of the pipe on the first didOpen
    CrashOnOpen,
    /// Answers the first didOpen with a frame that is not JSON, then keeps
    /// the pipe open
    Garbage,
    /// Asks for workspace/configuration on didOpen
    AsksConfiguration,
    /// Launch fails like a missing executable
    Missing,
}

pub(crate) struct FakeLauncher {
    /// Behavior per launch; the last one repeats
    behaviors: Mutex<VecDeque<FakeBackend>>,
    delay: Duration,
    launches: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
    initialize_params: Arc<Mutex<Option<Value>>>,
}

impl FakeLauncher {
    pub(crate) fn new(behavior: FakeBackend) -> Self {
        Self::sequence(vec![behavior])
    }

    /// One behavior per successive launch
    pub(crate) fn sequence(behaviors: Vec<FakeBackend>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors.into()),
            delay: Duration::ZERO,
            launches: AtomicUsize::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
            initialize_params: Arc::new(Mutex::new(None)),
        }
    }

    /// Delay every launch, widening the window for concurrent callers
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set_behavior(&self, behavior: FakeBackend) {
        *self.behaviors.lock().unwrap() = VecDeque::from([behavior]);
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Every method received by any fake instance, in arrival order
    pub(crate) fn methods(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|m| *m == method).count()
    }

    pub(crate) fn position(&self, method: &str) -> Option<usize> {
        self.log.lock().unwrap().iter().position(|m| m == method)
    }

    pub(crate) fn last_initialize(&self) -> Option<Value> {
        self.initialize_params.lock().unwrap().clone()
    }

    /// Poll the log until `method` shows up (1s cap)
    pub(crate) async fn wait_for(&self, method: &str) -> bool {
        for _ in 0..100 {
            if self.count(method) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(
        &self,
        config: &BackendConfig,
        _workdir: Option<&Path>,
    ) -> Result<BackendIo, LspError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = {
            let mut behaviors = self.behaviors.lock().unwrap();
            if behaviors.len() > 1 {
                behaviors.pop_front()
            } else {
                behaviors.front().cloned()
            }
        }
        .unwrap_or(FakeBackend::Clean);
        if matches!(behavior, FakeBackend::Missing) {
            return Err(LspError::ServerStart(format!(
                "{}: No such file or directory",
                config.display_command()
            )));
        }

        let (client, server) = tokio::io::duplex(1 << 16);
        let (reader, writer) = tokio::io::split(client);
        tokio::spawn(serve(
            behavior,
            server,
            Arc::clone(&self.log),
            Arc::clone(&self.initialize_params),
        ));

        Ok(BackendIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }
}

async fn serve(
    behavior: FakeBackend,
    stream: DuplexStream,
    log: Arc<Mutex<Vec<String>>>,
    initialize_params: Arc<Mutex<Option<Value>>>,
) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut transport = Transport::new(reader);
    let record = |method: &str| log.lock().unwrap().push(method.to_string());

    while let Ok(message) = transport.read_message().await {
        match message {
            Message::Request(request) => {
                record(&request.method);
                let result = match request.method.as_str() {
                    "initialize" => {
                        if matches!(behavior, FakeBackend::Silent) {
                            continue;
                        }
                        *initialize_params.lock().unwrap() = request.params.clone();
                        serde_json::json!({
                            "capabilities": { "textDocumentSync": 1 },
                            "serverInfo": { "name": "fake-ls", "version": "0.0.1" }
                        })
                    }
                    _ => Value::Null,
                };
                let response = Response::success(request.id, result);
                if write_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Message::Notification(notification) => {
                record(&notification.method);
                match notification.method.as_str() {
                    "exit" => break,
                    "textDocument/didOpen" | "textDocument/didChange" => {
                        let document = notification
                            .params
                            .as_ref()
                            .map(|p| p["textDocument"].clone())
                            .unwrap_or(Value::Null);
                        match &behavior {
                            FakeBackend::CrashOnOpen => break,
                            FakeBackend::Garbage => {
                                record("<garbage>");
                                let frame = b"Content-Length: 9\r\n\r\nnot json!";
                                if writer.write_all(frame).await.is_err() {
                                    break;
                                }
                            }
                            FakeBackend::Publish(diagnostics) => {
                                let publish = Notification::new(
                                    "textDocument/publishDiagnostics",
                                    Some(serde_json::json!({
                                        "uri": document["uri"],
                                        "version": document["version"],
                                        "diagnostics": diagnostics,
                                    })),
                                );
                                record("<publish>");
                                if write_notification(&mut writer, &publish).await.is_err() {
                                    break;
                                }
                            }
                            FakeBackend::AsksConfiguration => {
                                let ask = Request {
                                    jsonrpc: "2.0".to_string(),
                                    id: RequestId::String("cfg-1".to_string()),
                                    method: "workspace/configuration".to_string(),
                                    params: Some(serde_json::json!({
                                        "items": [{ "section": "pylsp" }]
                                    })),
                                };
                                if write_request(&mut writer, &ask).await.is_err() {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            Message::Response(response) => {
                if response.is_success() {
                    record("<response>");
                }
            }
        }
    }
}
