//! Stdio transport for the MCP tool server.
//!
//! The server script is spawned as a child process and spoken to over
//! newline-delimited JSON-RPC 2.0 on its stdin/stdout. A background task
//! reads stdout and routes responses to pending requests; requests from the
//! server itself (`ping`) are answered inline.

use crate::application::bridge::ToolTransport;
use crate::domain::types::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("server script '{path}' must be a .py or .js file")]
    UnsupportedScript { path: PathBuf },
    #[error("failed to spawn tool server '{script}': {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server '{script}' transport error: {message}")]
    Transport { script: String, message: String },
    #[error("tool server '{script}' sent invalid JSON: {source}")]
    InvalidJson {
        script: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool server '{script}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        script: String,
        code: i64,
        message: String,
    },
    #[error("tool server '{script}' terminated unexpectedly")]
    Terminated { script: String },
    #[error("tool server '{script}' request cancelled")]
    Cancelled { script: String },
}

/// Host runtime a server script runs under, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRuntime {
    Python,
    Node,
}

impl ServerRuntime {
    pub fn from_path(path: &Path) -> Result<Self, ToolInvokeError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("py") => Ok(ServerRuntime::Python),
            Some("js") => Ok(ServerRuntime::Node),
            _ => Err(ToolInvokeError::UnsupportedScript {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            ServerRuntime::Python => "python",
            ServerRuntime::Node => "node",
        }
    }
}

#[derive(Clone, Debug)]
pub struct McpProcess {
    inner: Arc<McpProcessInner>,
}

#[derive(Debug)]
struct McpProcessInner {
    script: String,
    state: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, ToolInvokeError>>>>,
    id_counter: AtomicU64,
}

impl McpProcess {
    /// Spawn the server script under its host runtime and complete the MCP
    /// handshake (`initialize` + `notifications/initialized`).
    pub async fn connect(script_path: &Path) -> Result<Self, ToolInvokeError> {
        let runtime = ServerRuntime::from_path(script_path)?;
        let script = script_path.display().to_string();

        let mut child = Command::new(runtime.command())
            .arg(script_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ToolInvokeError::Spawn {
                script: script.clone(),
                source,
            })?;

        let inner = Arc::new(McpProcessInner {
            script,
            state: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
        });

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| inner.transport_error("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| inner.transport_error("failed to capture server stdout"))?;

        *inner.writer.lock().await = Some(BufWriter::new(stdin));
        *inner.state.lock().await = Some(child);

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(stdout).await;
        });

        let process = Self { inner };
        match process.initialize().await {
            Ok(()) => Ok(process),
            Err(err) => {
                process.shutdown().await;
                Err(err)
            }
        }
    }

    async fn initialize(&self) -> Result<(), ToolInvokeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.inner.send_request("initialize", params).await?;
        self.inner
            .send_notification("notifications/initialized", json!({}))
            .await?;
        info!(script = self.inner.script.as_str(), "Tool server handshake complete");
        Ok(())
    }

    /// Fetch the advertised tool catalog. Called once per connection.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolInvokeError> {
        let result = self.inner.send_request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|source| ToolInvokeError::InvalidJson {
            script: self.inner.script.clone(),
            source,
        })
    }

    /// Kill the child process and fail any pending requests. Safe to call on
    /// every exit path, including after a failed handshake.
    pub async fn shutdown(&self) {
        self.inner.reset().await;
    }
}

#[async_trait]
impl ToolTransport for McpProcess {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
        let params = json!({
            "name": name,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.send_request("tools/call", params).await
    }
}

impl McpProcessInner {
    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(raw)) = lines.next_line().await {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => self.process_inbound_message(value).await,
                Err(source) => {
                    warn!(
                        script = self.script.as_str(),
                        line = trimmed,
                        %source,
                        "received invalid JSON from tool server"
                    );
                }
            }
        }

        self.reset().await;
    }

    async fn process_inbound_message(&self, value: Value) {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.handle_server_request(id, value).await;
            } else {
                self.handle_response(id, value).await;
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(
                script = self.script.as_str(),
                method,
                "ignoring notification from tool server"
            );
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let Some(key) = id.as_u64() else {
            debug!(script = self.script.as_str(), ?id, "response with non-numeric id");
            return;
        };

        let responder = self.pending.lock().await.remove(&key);
        let Some(sender) = responder else {
            debug!(
                script = self.script.as_str(),
                response_id = key,
                "received response for unknown request"
            );
            return;
        };

        let outcome = if let Some(error) = value.get("error") {
            Err(ToolInvokeError::Rpc {
                script: self.script.clone(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
    }

    async fn handle_server_request(&self, id: Value, value: Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let outcome = match method {
            "ping" => self.send_response(id, json!({})).await,
            other => {
                warn!(
                    script = self.script.as_str(),
                    method = other,
                    "tool server sent unsupported request"
                );
                let error = json!({
                    "code": -32601,
                    "message": format!("client does not implement method '{other}'"),
                });
                self.send_error(id, error).await
            }
        };
        if let Err(err) = outcome {
            warn!(script = self.script.as_str(), %err, "failed to answer server request");
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ToolInvokeError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolInvokeError::Cancelled {
                script: self.script.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result
        });
        self.write_message(&payload).await
    }

    async fn send_error(&self, id: Value, error: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": error
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), ToolInvokeError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| ToolInvokeError::InvalidJson {
                script: self.script.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("writer not initialised"))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))
    }

    async fn reset(&self) {
        *self.writer.lock().await = None;

        let mut state = self.state.lock().await;
        if let Some(mut child) = state.take() {
            if let Err(err) = child.kill().await {
                debug!(
                    script = self.script.as_str(),
                    %err,
                    "failed to kill tool server process (may have already exited)"
                );
            }
            let _ = child.wait().await;
        }
        drop(state);

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolInvokeError::Terminated {
                script: self.script.clone(),
            }));
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ToolInvokeError {
        ToolInvokeError::Transport {
            script: self.script.clone(),
            message: message.into(),
        }
    }
}
