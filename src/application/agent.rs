//! The tool-call resolution loop.
//!
//! Alternates between asking the model for the next step and executing the
//! tool calls it requested, appending every exchange to the conversation,
//! until the model answers with no further tool calls.

use crate::application::bridge::{BridgeError, ToolBridge, ToolTransport};
use crate::application::catalog::FunctionSpec;
use crate::domain::conversation::Conversation;
use crate::domain::types::ChatMessage;
use crate::infrastructure::model::{ModelError, ModelProvider};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SYSTEM_PROMPT: &str =
    "You are a helpful assistant with access to tools. You must follow the schema of the tools.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model kept requesting tools after {rounds} rounds")]
    LoopBudgetExceeded { rounds: usize },
}

impl AgentError {
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Model(err) => err.user_message(),
            AgentError::LoopBudgetExceeded { rounds } => format!(
                "The model kept requesting tools after {rounds} rounds and the query was abandoned. \
                 Raise MAX_TOOL_ROUNDS if the task genuinely needs more."
            ),
        }
    }
}

/// One executed tool call, recorded for console echo.
#[derive(Debug, Clone)]
pub struct ToolStep {
    pub tool: String,
    pub arguments: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub response: String,
    pub steps: Vec<ToolStep>,
}

pub struct Agent<P: ModelProvider, T: ToolTransport> {
    provider: P,
    bridge: ToolBridge<T>,
    catalog: Vec<FunctionSpec>,
    max_tool_rounds: usize,
}

impl<P: ModelProvider, T: ToolTransport> Agent<P, T> {
    pub fn new(
        provider: P,
        bridge: ToolBridge<T>,
        catalog: Vec<FunctionSpec>,
        max_tool_rounds: usize,
    ) -> Self {
        Self {
            provider,
            bridge,
            catalog,
            max_tool_rounds,
        }
    }

    pub fn catalog(&self) -> &[FunctionSpec] {
        &self.catalog
    }

    /// Resolve one user query against the model and the tool server.
    ///
    /// The conversation always travels whole: system message first, then the
    /// full accumulated history. Tool calls within a batch are dispatched
    /// strictly in the order the model emitted them, one tool-role message
    /// appended per call. Tool-level failures are absorbed into the
    /// conversation so the model can react; provider failures abort the
    /// query. On abort the partial history is retained.
    pub async fn process_query(
        &self,
        conversation: &mut Conversation,
        query: String,
    ) -> Result<QueryOutcome, AgentError> {
        conversation.push(ChatMessage::user(query));
        let mut steps = Vec::new();
        let mut rounds_used = 0usize;

        loop {
            debug!(
                history = conversation.len(),
                rounds_used, "Requesting next step from model"
            );
            let completion = self
                .provider
                .complete(conversation.messages(), &self.catalog)
                .await?;

            if completion.tool_calls.is_empty() {
                let response = completion.content.unwrap_or_default();
                conversation.push(ChatMessage::assistant(response.clone()));
                info!(rounds_used, steps = steps.len(), "Query resolved");
                return Ok(QueryOutcome { response, steps });
            }

            if rounds_used == self.max_tool_rounds {
                warn!(
                    rounds = rounds_used,
                    "Model requested another tool batch past the round budget"
                );
                return Err(AgentError::LoopBudgetExceeded { rounds: rounds_used });
            }

            conversation.push(ChatMessage::assistant_tool_calls(
                completion.content.clone(),
                completion.tool_calls.clone(),
            ));

            for call in &completion.tool_calls {
                info!(tool = call.name.as_str(), id = call.id.as_str(), "Executing tool call");
                let (content, success) = match self.bridge.invoke(&call.name, &call.arguments).await
                {
                    Ok(content) => (content, true),
                    Err(err @ BridgeError::MalformedArguments { .. }) => {
                        warn!(tool = call.name.as_str(), %err, "Tool call had malformed arguments");
                        (json!({ "error": err.to_string() }).to_string(), false)
                    }
                    Err(err @ BridgeError::ExecutionFailed { .. }) => {
                        warn!(tool = call.name.as_str(), %err, "Tool execution failed");
                        (json!({ "error": err.to_string() }).to_string(), false)
                    }
                };
                steps.push(ToolStep {
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                    success,
                });
                conversation.push(ChatMessage::tool_result(call.id.clone(), content));
            }

            rounds_used += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bridge::ToolTransport;
    use crate::domain::types::{MessageRole, ToolCallRequest};
    use crate::infrastructure::model::Completion;
    use crate::infrastructure::server::ToolInvokeError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct ScriptedProvider {
        completions: Arc<Mutex<VecDeque<Completion>>>,
        seen_history_lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedProvider {
        fn with(completions: Vec<Completion>) -> Self {
            Self {
                completions: Arc::new(Mutex::new(completions.into())),
                seen_history_lengths: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[FunctionSpec],
        ) -> Result<Completion, ModelError> {
            assert_eq!(messages[0].role, MessageRole::System, "system message must lead");
            self.seen_history_lengths.lock().await.push(messages.len());
            self.completions
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| ModelError::invalid_response("script exhausted"))
        }
    }

    #[derive(Clone, Default)]
    struct StubTransport {
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolTransport for StubTransport {
        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<Value, ToolInvokeError> {
            self.calls.lock().await.push(name.to_string());
            if self.fail {
                Err(ToolInvokeError::Terminated {
                    script: "stub.py".into(),
                })
            } else {
                Ok(serde_json::json!({ "content": "4" }))
            }
        }
    }

    fn final_answer(text: &str) -> Completion {
        Completion {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        }
    }

    fn tool_batch(calls: &[(&str, &str, &str)]) -> Completion {
        Completion {
            content: None,
            tool_calls: calls
                .iter()
                .map(|(id, name, arguments)| ToolCallRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                })
                .collect(),
        }
    }

    fn agent(
        provider: ScriptedProvider,
        transport: StubTransport,
        max_rounds: usize,
    ) -> Agent<ScriptedProvider, StubTransport> {
        Agent::new(provider, ToolBridge::new(transport), Vec::new(), max_rounds)
    }

    #[tokio::test]
    async fn plain_answer_appends_two_messages() {
        let provider = ScriptedProvider::with(vec![final_answer("4")]);
        let agent = agent(provider, StubTransport::default(), 4);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        let outcome = agent
            .process_query(&mut conversation, "what is 2+2".into())
            .await
            .unwrap();

        assert_eq!(outcome.response, "4");
        assert!(outcome.steps.is_empty());
        // system + user + assistant
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation.messages()[2].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn one_tool_round_appends_four_messages_in_order() {
        let provider = ScriptedProvider::with(vec![
            tool_batch(&[("call-1", "add", r#"{"a":2,"b":2}"#)]),
            final_answer("The answer is 4"),
        ]);
        let transport = StubTransport::default();
        let agent = agent(provider.clone(), transport.clone(), 4);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        let outcome = agent
            .process_query(&mut conversation, "add 2 and 2".into())
            .await
            .unwrap();

        assert_eq!(outcome.response, "The answer is 4");
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].success);
        assert_eq!(transport.calls.lock().await.as_slice(), ["add"]);

        let roles: Vec<MessageRole> = conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant,
            ]
        );
        let tool_message = &conversation.messages()[3];
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call-1"));

        // The second model round saw the full history including the tool result.
        assert_eq!(*provider.seen_history_lengths.lock().await, vec![2, 4]);
    }

    #[tokio::test]
    async fn tool_failure_is_absorbed_and_loop_continues() {
        let provider = ScriptedProvider::with(vec![
            tool_batch(&[("call-1", "add", "{}")]),
            final_answer("the tool is broken"),
        ]);
        let transport = StubTransport {
            fail: true,
            ..Default::default()
        };
        let agent = agent(provider, transport, 4);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        let outcome = agent
            .process_query(&mut conversation, "add".into())
            .await
            .unwrap();

        assert_eq!(outcome.response, "the tool is broken");
        assert_eq!(outcome.steps.len(), 1);
        assert!(!outcome.steps[0].success);

        let tool_message = &conversation.messages()[3];
        assert_eq!(tool_message.role, MessageRole::Tool);
        assert!(tool_message.content.as_deref().unwrap().contains("error"));
    }

    #[tokio::test]
    async fn malformed_arguments_never_crash_the_loop() {
        let provider = ScriptedProvider::with(vec![
            tool_batch(&[("call-1", "add", "{not json")]),
            final_answer("done"),
        ]);
        let transport = StubTransport::default();
        let agent = agent(provider, transport.clone(), 4);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        let outcome = agent
            .process_query(&mut conversation, "go".into())
            .await
            .unwrap();

        assert_eq!(outcome.response, "done");
        assert!(!outcome.steps[0].success);
        // The malformed call never reached the server.
        assert!(transport.calls.lock().await.is_empty());
        assert!(
            conversation.messages()[3]
                .content
                .as_deref()
                .unwrap()
                .contains("malformed arguments")
        );
    }

    #[tokio::test]
    async fn batch_calls_dispatch_sequentially_in_emitted_order() {
        let provider = ScriptedProvider::with(vec![
            tool_batch(&[("call-1", "first", "{}"), ("call-2", "second", "{}")]),
            final_answer("done"),
        ]);
        let transport = StubTransport::default();
        let agent = agent(provider, transport.clone(), 4);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        agent.process_query(&mut conversation, "go".into()).await.unwrap();

        assert_eq!(transport.calls.lock().await.as_slice(), ["first", "second"]);
        let ids: Vec<Option<&str>> = conversation.messages()[3..5]
            .iter()
            .map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec![Some("call-1"), Some("call-2")]);
    }

    #[tokio::test]
    async fn over_eager_model_hits_loop_budget() {
        let provider = ScriptedProvider::with(vec![
            tool_batch(&[("call-1", "add", "{}")]),
            tool_batch(&[("call-2", "add", "{}")]),
            tool_batch(&[("call-3", "add", "{}")]),
        ]);
        let transport = StubTransport::default();
        let agent = agent(provider, transport.clone(), 2);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        let err = agent
            .process_query(&mut conversation, "loop forever".into())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::LoopBudgetExceeded { rounds: 2 }));
        // Two full rounds ran before the budget check refused the third.
        assert_eq!(transport.calls.lock().await.len(), 2);
        // Partial history is retained: system + user + 2 * (assistant + tool).
        assert_eq!(conversation.len(), 6);
    }

    #[tokio::test]
    async fn provider_error_aborts_query_and_keeps_history() {
        let provider = ScriptedProvider::with(vec![tool_batch(&[("call-1", "add", "{}")])]);
        let agent = agent(provider, StubTransport::default(), 4);
        let mut conversation = Conversation::new(SYSTEM_PROMPT);

        let err = agent
            .process_query(&mut conversation, "go".into())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Model(_)));
        // system + user + assistant batch + tool result survive the abort.
        assert_eq!(conversation.len(), 4);
    }
}
