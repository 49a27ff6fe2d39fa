//! Tool invocation bridge between model-issued calls and the tool server.

use crate::infrastructure::server::ToolInvokeError;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Seam over the tool server transport so the bridge and the resolution loop
/// can be exercised without spawning a real server process.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolInvokeError>;
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("tool '{tool}' received malformed arguments: {source}")]
    MalformedArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool '{tool}' execution failed: {source}")]
    ExecutionFailed {
        tool: String,
        #[source]
        source: ToolInvokeError,
    },
}

pub struct ToolBridge<T: ToolTransport> {
    transport: T,
}

impl<T: ToolTransport> ToolBridge<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Dispatch one model-issued tool call.
    ///
    /// Arguments that fail to parse never reach the server. The call is made
    /// at most once; retries are the caller's policy, not the bridge's. On
    /// success the result's `content` is re-serialized as a JSON string for
    /// embedding as message content.
    pub async fn invoke(&self, tool: &str, arguments_json: &str) -> Result<String, BridgeError> {
        let arguments: Value =
            serde_json::from_str(arguments_json).map_err(|source| BridgeError::MalformedArguments {
                tool: tool.to_string(),
                source,
            })?;

        debug!(tool, "Dispatching tool call to server");
        let result = self
            .transport
            .call_tool(tool, arguments)
            .await
            .map_err(|source| BridgeError::ExecutionFailed {
                tool: tool.to_string(),
                source,
            })?;

        let content = result.get("content").cloned().unwrap_or(result);
        Ok(content.to_string())
    }
}
