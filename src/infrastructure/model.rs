//! OpenAI-compatible chat completions client.

use crate::application::catalog::FunctionSpec;
use crate::config::Settings;
use crate::domain::types::{ChatMessage, ToolCallRequest};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// One model turn: optional text plus the tool calls it requested, in the
/// order the model emitted them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The provider has no memory across requests; every call carries the whole
/// message sequence plus the tool catalog.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[FunctionSpec],
    ) -> Result<Completion, ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error calling model provider: {source}")]
    Network {
        #[source]
        source: reqwest::Error,
    },
    #[error("model provider returned an invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl ModelError {
    pub fn network(source: reqwest::Error) -> Self {
        Self::Network { source }
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ModelError::Network { source } => {
                if source.is_connect() {
                    "Could not connect to the model provider.".to_string()
                } else if source.is_timeout() {
                    "The model provider request timed out.".to_string()
                } else if let Some(status) = source.status() {
                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            "The model provider rejected the API key.".to_string()
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            "The model provider is rate limiting requests.".to_string()
                        }
                        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                            "The model provider is currently unavailable.".to_string()
                        }
                        _ => format!("The model provider request failed: {}", status.as_u16()),
                    }
                } else {
                    "A network error occurred talking to the model provider.".to_string()
                }
            }
            ModelError::InvalidResponse { .. } => {
                "The model provider returned a response this client could not read.".to_string()
            }
        }
    }
}

/// Client for any provider speaking the OpenAI chat completions protocol.
#[derive(Clone)]
pub struct OpenAiProvider {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: Client::new(),
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[FunctionSpec],
    ) -> Result<Completion, ModelError> {
        let payload = WireRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: if tools.is_empty() { None } else { Some(tools) },
        };

        info!(
            model = self.model.as_str(),
            messages = messages.len(),
            tools = tools.len(),
            "Sending chat completion request"
        );

        let response: WireResponse = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(ModelError::network)?
            .error_for_status()
            .map_err(ModelError::network)?
            .json()
            .await
            .map_err(ModelError::network)?;

        let message = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .ok_or_else(|| ModelError::invalid_response("completion has no choices"))?;

        let tool_calls: Vec<ToolCallRequest> = message
            .tool_calls
            .into_iter()
            .map(|call| ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();
        debug!(
            tool_calls = tool_calls.len(),
            "Received chat completion response"
        );

        Ok(Completion {
            content: message.content,
            tool_calls,
        })
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [FunctionSpec]>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: &call.id,
                        call_type: "function",
                        function: WireFunctionCall {
                            name: &call.name,
                            arguments: &call.arguments,
                        },
                    })
                    .collect(),
            )
        };

        Self {
            role: message.role.as_str(),
            content: message.content.as_deref(),
            tool_calls,
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunctionCall<'a>,
}

#[derive(Serialize)]
struct WireFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: Option<WireResponseMessage>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireResponseToolCall>,
}

#[derive(Deserialize)]
struct WireResponseToolCall {
    id: String,
    function: WireResponseFunction,
}

#[derive(Deserialize)]
struct WireResponseFunction {
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MessageRole;
    use serde_json::json;

    #[test]
    fn assistant_tool_call_message_serializes_without_content() {
        let message = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCallRequest {
                id: "call-1".into(),
                name: "add".into(),
                arguments: r#"{"a":2,"b":2}"#.into(),
            }],
        );

        let wire = serde_json::to_value(WireMessage::from(&message)).unwrap();
        assert_eq!(wire["role"], "assistant");
        assert!(wire.get("content").is_none());
        assert_eq!(wire["tool_calls"][0]["id"], "call-1");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "add");
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            r#"{"a":2,"b":2}"#
        );
    }

    #[test]
    fn tool_result_message_carries_back_reference() {
        let message = ChatMessage::tool_result("call-1", "[]");
        let wire = serde_json::to_value(WireMessage::from(&message)).unwrap();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call-1");
        assert_eq!(wire["content"], "[]");
        assert!(wire.get("tool_calls").is_none());
    }

    #[test]
    fn response_with_tool_calls_parses_into_completion() {
        let wire: WireResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "type": "function",
                        "function": { "name": "add", "arguments": "{\"a\":2,\"b\":2}" }
                    }]
                }
            }]
        }))
        .unwrap();

        let message = wire.choices.into_iter().next().unwrap().message.unwrap();
        assert!(message.content.is_none());
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].function.name, "add");
    }

    #[test]
    fn system_message_is_first_in_wire_request() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let wire: Vec<WireMessage> = messages.iter().map(WireMessage::from).collect();
        assert_eq!(wire[0].role, MessageRole::System.as_str());
        assert_eq!(wire[1].role, "user");
    }
}
