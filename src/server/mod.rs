//! Tool-call server
//!
//! Newline-delimited JSON-RPC over a reader/writer pair (stdio in
//! production). Requests run concurrently up to `max_concurrent`; every
//! response goes through a single writer task so lines never interleave.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::config::RuntimeConfig;
use crate::models::config::ServerSettings;
use crate::models::diagnostic::ValidationResult;
use crate::services::validation::Validator;
use protocol::{
    DEFAULT_PROTOCOL_VERSION, Request, Response, RpcError, ToolCallParams, ToolResult,
    VALIDATE_TOOL, ValidateArgs, methods,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_concurrent: usize,
    /// Backends unused this long are stopped; `None` disables reaping
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Duration,
    /// Backstop for a single request; must outlast the backend start budget
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(&ServerSettings::default(), &RuntimeConfig::default())
    }
}

impl ServerConfig {
    pub fn new(settings: &ServerSettings, runtime: &RuntimeConfig) -> Self {
        Self {
            max_concurrent: settings.max_concurrent.max(1),
            idle_timeout: (settings.idle_timeout_mins > 0)
                .then(|| Duration::from_secs(settings.idle_timeout_mins.saturating_mul(60))),
            reap_interval: Duration::from_secs(60),
            request_timeout: runtime.validation_budget(),
        }
    }
}

pub struct ToolServer {
    validator: Arc<dyn Validator>,
    config: ServerConfig,
    semaphore: Arc<Semaphore>,
}

impl ToolServer {
    pub fn new(validator: Arc<dyn Validator>, config: ServerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            validator,
            config,
        }
    }

    /// Serve until `reader` hits EOF, then stop every backend.
    pub async fn run<R, W>(self, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_loop(writer, rx));

        let mut lines = BufReader::new(reader).lines();
        let mut tasks = JoinSet::new();
        let mut reap_interval = tokio::time::interval(self.config.reap_interval);
        reap_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("Tool server ready");

        let result = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        self.spawn_request(&mut tasks, line, tx.clone());
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Request task failed: {}", e);
                    }
                }
                _ = reap_interval.tick() => {
                    if let Some(idle) = self.config.idle_timeout {
                        let validator = Arc::clone(&self.validator);
                        tasks.spawn(async move {
                            let reaped = validator.reap_idle(idle).await;
                            if reaped > 0 {
                                tracing::info!("Stopped {} idle backend(s)", reaped);
                            }
                        });
                    }
                }
            }
        };

        tracing::info!("Input closed, shutting down");
        while tasks.join_next().await.is_some() {}
        self.validator.shutdown().await;

        drop(tx);
        if let Err(e) = writer_task.await {
            tracing::warn!("Writer task failed: {}", e);
        }
        result
    }

    fn spawn_request(
        &self,
        tasks: &mut JoinSet<()>,
        line: String,
        tx: mpsc::UnboundedSender<String>,
    ) {
        let validator = Arc::clone(&self.validator);
        let semaphore = Arc::clone(&self.semaphore);
        let request_timeout = self.config.request_timeout;

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            let response = match tokio::time::timeout(
                request_timeout,
                process_line(&line, validator.as_ref()),
            )
            .await
            {
                Ok(response) => response,
                Err(_) => timed_out(&line, request_timeout),
            };

            if let Some(response) = response {
                let json = serde_json::to_string(&response).unwrap_or_else(|_| {
                    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Serialization error"}}"#.to_string()
                });
                let _ = tx.send(json);
            }
        });
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(json) = rx.recv().await {
        let written = async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!("Failed to write response: {}", e);
            break;
        }
    }
}

/// Reply for a request cut off after `limit`.
///
/// A validate call still gets a tool result, flagged as an error.
fn timed_out(line: &str, limit: Duration) -> Option<Response> {
    let request = serde_json::from_str::<Request>(line).ok()?;
    if request.is_notification() {
        return None;
    }
    tracing::warn!("{} did not finish within {:?}", request.method, limit);

    let file_path = (request.method == methods::TOOLS_CALL)
        .then(|| request.params.as_ref())
        .flatten()
        .and_then(|p| p.get("arguments"))
        .and_then(|a| a.get("file_path"))
        .and_then(Value::as_str);

    let Some(file_path) = file_path else {
        return Some(Response::error(
            request.id,
            RpcError::internal_error("Request timed out"),
        ));
    };

    let result = ValidationResult::failure(
        file_path,
        format!("Validation did not finish within {:?}", limit),
    );
    Some(match serde_json::to_value(ToolResult::from(&result)) {
        Ok(value) => Response::success(request.id.clone(), value),
        Err(e) => Response::error(request.id.clone(), RpcError::internal_error(&e.to_string())),
    })
}

/// Handle one input line; notifications produce no response
async fn process_line(line: &str, validator: &dyn Validator) -> Option<Response> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Some(Response::error(None, RpcError::parse_error())),
    };

    let request: Request = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(_) => return Some(Response::error(None, RpcError::invalid_request())),
    };

    tracing::trace!("<- {}", request.method);

    if request.is_notification() {
        match request.method.as_str() {
            methods::INITIALIZED | methods::CANCELLED => {}
            other => tracing::debug!("Ignoring notification {}", other),
        }
        return None;
    }

    let id = request.id.clone();
    Some(match dispatch(&request, validator).await {
        Ok(v) => Response::success(id, v),
        Err(e) => Response::error(id, e),
    })
}

async fn dispatch(request: &Request, validator: &dyn Validator) -> Result<Value, RpcError> {
    let params = request.params.clone().unwrap_or(serde_json::json!({}));

    match request.method.as_str() {
        methods::INITIALIZE => Ok(handle_initialize(&params)),
        methods::PING => Ok(serde_json::json!({})),
        methods::TOOLS_LIST => Ok(serde_json::json!({ "tools": [protocol::validate_tool()] })),
        methods::TOOLS_CALL => handle_tool_call(params, validator).await,
        other => Err(RpcError::method_not_found(other)),
    }
}

fn handle_initialize(params: &Value) -> Value {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);

    serde_json::json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

async fn handle_tool_call(params: Value, validator: &dyn Validator) -> Result<Value, RpcError> {
    let call: ToolCallParams =
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(&e.to_string()))?;

    if call.name != VALIDATE_TOOL {
        return Err(RpcError::invalid_params(&format!("Unknown tool: {}", call.name)));
    }

    let args: ValidateArgs = call
        .arguments
        .ok_or_else(|| RpcError::invalid_params("missing arguments"))
        .and_then(|a| {
            serde_json::from_value(a).map_err(|e| RpcError::invalid_params(&e.to_string()))
        })?;

    let result = validator.validate(&args.file_path).await;
    serde_json::to_value(ToolResult::from(&result))
        .map_err(|e| RpcError::internal_error(&e.to_string()))
}
