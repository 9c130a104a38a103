//! Conversation Controller (C8): drives one turn-by-turn loop of LLM calls and tool dispatch.
//!
//! State machine per turn: `READY → CALL_LLM → {FINAL | TOOLS}`, and on the tools branch
//! `TOOLS → DISPATCH → COLLECT → CONTEXT_MAINTAIN → READY`. [`Controller::run_turn`] drives this
//! loop to completion (a final assistant message with no further tool calls, a forced
//! finalization at `maxTurns`, or cancellation) and returns the accumulated history alongside the
//! final text.
//!
//! Tool-call origin resolution, offloading, and summarization are delegated to
//! [`crate::custom_tools`], [`crate::context_manager`], and the injected
//! [`VirtualToolHandler`]/[`StreamCallbackDispatcher`] respectively; the Controller itself only
//! orchestrates the loop and the bookkeeping described in §4.8.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, TokenUsage, ToolDefinition};
use crate::config::ServerConfig;
use crate::context_manager;
use crate::custom_tools::{CustomToolRegistry, ToolResult, VIRTUAL_TOOL_NAMES};
use crate::error::ControllerError;
use crate::event::{EventEmitter, RuntimeEvent};
use crate::session_registry::SessionRegistry;

/// How a custom tool marked as a stream callback is actually dispatched: the Controller doesn't
/// own the Streaming Gateway, so it calls out through this trait instead.
#[async_trait]
pub trait StreamCallbackDispatcher: Send + Sync {
    async fn dispatch(&self, call_id: &str, tool_name: &str, arguments: Value) -> ToolResult;
}

/// Handler for the runtime's reserved virtual tools (`get_prompt`, `get_resource`,
/// `search_tools`, `add_tool`, `discover_code_files`, `write_code`, and the large-output
/// accessors). Supplied by [`crate::agent::Agent`], which alone holds the state (prompt/resource
/// inventories, effective toolset, generated-code directory) these handlers need.
#[async_trait]
pub trait VirtualToolHandler: Send + Sync {
    async fn handle(&self, name: &str, arguments: Value) -> ToolResult;
}

/// A [`VirtualToolHandler`] that refuses every call; useful as a placeholder before an Agent
/// wires up the real inventories, and in tests that don't exercise virtual tools.
pub struct NullVirtualToolHandler;

#[async_trait]
impl VirtualToolHandler for NullVirtualToolHandler {
    async fn handle(&self, name: &str, _arguments: Value) -> ToolResult {
        ToolResult::error(format!("virtual tool {} is not wired up", name))
    }
}

/// Tuning knobs for one Controller instance, set once at Agent construction time.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_turns: usize,
    pub large_output_threshold: usize,
    pub keep_messages: usize,
    pub force_finalize_on_max_turns: bool,
    pub offload_dir: PathBuf,
    /// Ratio of estimated history tokens to `context_window` past which summarization is
    /// triggered before the next LLM call, when `Some`.
    pub token_threshold: Option<f64>,
    pub context_window: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            large_output_threshold: context_manager::DEFAULT_LARGE_OUTPUT_THRESHOLD,
            keep_messages: context_manager::DEFAULT_KEEP_MESSAGES,
            force_finalize_on_max_turns: true,
            offload_dir: PathBuf::from(".mcp_offload"),
            token_threshold: None,
            context_window: 128_000,
        }
    }
}

/// Everything the Controller needs to drive one question through to a final answer.
pub struct TurnRequest<'a> {
    /// Full history including the system prompt at index 0, if any.
    pub history: Vec<Message>,
    pub question: Option<String>,
    pub tool_to_server: &'a HashMap<String, String>,
    pub tools_for_llm: Vec<ToolDefinition>,
    pub temperature: f32,
    pub cancel: CancellationToken,
}

/// Result of driving a [`TurnRequest`] to completion, or as far as it got before cancellation.
pub struct TurnOutcome {
    /// Empty when `cancelled` is `true`: cancellation never produces a final assistant message.
    pub final_text: String,
    pub history: Vec<Message>,
    pub usage: Vec<TokenUsage>,
    /// Set when `request.cancel` fired before a final assistant message was produced. `history`
    /// still holds every message built up to the cancellation point (§7 cancellation policy:
    /// propagate immediately, no partial writes, but don't drop accumulated progress).
    pub cancelled: bool,
}

/// Drives the per-turn LLM-call / tool-dispatch loop for one agent.
pub struct Controller {
    client: Arc<dyn ClientWrapper>,
    session_registry: Arc<SessionRegistry>,
    server_configs: Arc<HashMap<String, ServerConfig>>,
    custom_tools: Arc<CustomToolRegistry>,
    virtual_tools: Arc<dyn VirtualToolHandler>,
    stream_dispatcher: RwLock<Option<Arc<dyn StreamCallbackDispatcher>>>,
    events: Arc<EventEmitter>,
    session_id: String,
    config: ControllerConfig,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ClientWrapper>,
        session_registry: Arc<SessionRegistry>,
        server_configs: Arc<HashMap<String, ServerConfig>>,
        custom_tools: Arc<CustomToolRegistry>,
        virtual_tools: Arc<dyn VirtualToolHandler>,
        stream_dispatcher: Option<Arc<dyn StreamCallbackDispatcher>>,
        events: Arc<EventEmitter>,
        session_id: impl Into<String>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            session_registry,
            server_configs,
            custom_tools,
            virtual_tools,
            stream_dispatcher: RwLock::new(stream_dispatcher),
            events,
            session_id: session_id.into(),
            config,
        }
    }

    /// (Re)bind the dispatcher a gateway connection uses for stream-callback tools. A connection
    /// attaches on accept and should detach (pass `None`) on disconnect so a stale dispatcher
    /// doesn't receive calls meant for a since-reconnected client.
    pub async fn set_stream_dispatcher(&self, dispatcher: Option<Arc<dyn StreamCallbackDispatcher>>) {
        *self.stream_dispatcher.write().await = dispatcher;
    }

    /// Drive one question through `READY → CALL_LLM → {FINAL | TOOLS} → ... → READY` until a
    /// final assistant message is produced, `maxTurns` forces finalization, or `request.cancel`
    /// fires.
    pub async fn run_turn(&self, request: TurnRequest<'_>) -> Result<TurnOutcome, ControllerError> {
        let TurnRequest {
            mut history,
            question,
            tool_to_server,
            tools_for_llm,
            temperature,
            cancel,
        } = request;

        if let Some(question) = question {
            history.push(Message {
                role: Role::User,
                content: Arc::from(question),
                tool_calls: vec![],
            });
        }

        let mut turn = 0usize;
        let mut usages = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome { final_text: String::new(), history, usage: usages, cancelled: true });
            }

            if turn >= self.config.max_turns {
                return self.finalize_on_max_turns(history, temperature, &mut usages).await;
            }

            if self.should_summarize_for_tokens(&history) {
                history = self.summarize(history).await?;
            }

            let response = self
                .call_llm(&history, Some(tools_for_llm.clone()), temperature)
                .await?;
            if let Some(usage) = self.client.get_last_usage().await {
                usages.push(usage);
            }

            if response.tool_calls.is_empty() {
                let final_text = response.content.to_string();
                history.push(response);
                return Ok(TurnOutcome { final_text, history, usage: usages, cancelled: false });
            }

            let calls = response.tool_calls.clone();
            history.push(response);

            for call in &calls {
                if cancel.is_cancelled() {
                    return Ok(TurnOutcome { final_text: String::new(), history, usage: usages, cancelled: true });
                }
                let result = self.dispatch_tool(call, tool_to_server).await;
                let stored = self.store_result(&call.name, result).await;
                history.push(Message {
                    role: Role::Tool { call_id: call.id.clone() },
                    content: Arc::from(stored),
                    tool_calls: vec![],
                });
            }

            turn += 1;
        }
    }

    async fn finalize_on_max_turns(
        &self,
        mut history: Vec<Message>,
        temperature: f32,
        usages: &mut Vec<TokenUsage>,
    ) -> Result<TurnOutcome, ControllerError> {
        if !self.config.force_finalize_on_max_turns {
            return Err(ControllerError::Llm(format!(
                "max turns ({}) exceeded",
                self.config.max_turns
            )));
        }

        history = match self.summarize(history.clone()).await {
            Ok(summarized) => summarized,
            Err(e) => {
                log::warn!("controller: forced summarization at max turns failed: {}", e);
                history
            }
        };

        history.push(Message {
            role: Role::User,
            content: Arc::from("Provide your final answer now based on everything above."),
            tool_calls: vec![],
        });

        let response = self.call_llm(&history, None, temperature).await?;
        if let Some(usage) = self.client.get_last_usage().await {
            usages.push(usage);
        }
        let final_text = response.content.to_string();
        history.push(response);
        Ok(TurnOutcome {
            final_text,
            history,
            usage: usages.clone(),
            cancelled: false,
        })
    }

    fn should_summarize_for_tokens(&self, history: &[Message]) -> bool {
        let Some(threshold) = self.config.token_threshold else {
            return false;
        };
        if self.config.context_window == 0 {
            return false;
        }
        let estimated = estimate_token_count(history);
        (estimated as f64) >= threshold * (self.config.context_window as f64)
    }

    async fn call_llm(
        &self,
        history: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        _temperature: f32,
    ) -> Result<Message, ControllerError> {
        self.client
            .send_message(history, tools)
            .await
            .map_err(|e| ControllerError::Llm(e.to_string()))
    }

    async fn summarize(&self, history: Vec<Message>) -> Result<Vec<Message>, ControllerError> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        self.events.emit(RuntimeEvent::ContextSummarizationStarted {
            trace_id: trace_id.clone(),
            session_id: self.session_id.clone(),
            history_len: history.len(),
        });

        let original_system_prompt = history
            .first()
            .cloned()
            .unwrap_or_else(|| Message { role: Role::System, content: Arc::from(""), tool_calls: vec![] });

        let (_old, keep) = context_manager::split_for_summarization(&history, self.config.keep_messages);

        let mut summarizer_messages = vec![Message {
            role: Role::System,
            content: Arc::from(context_manager::SUMMARIZATION_SYSTEM_PROMPT),
            tool_calls: vec![],
        }];
        summarizer_messages.extend(history.iter().cloned());
        summarizer_messages.push(Message {
            role: Role::User,
            content: Arc::from("Summarize the conversation above now."),
            tool_calls: vec![],
        });

        match self.client.send_message(&summarizer_messages, None).await {
            Ok(response) => {
                let summary = response.content.to_string();
                let rebuilt =
                    context_manager::rebuild_history(original_system_prompt, summary.clone(), keep);
                self.events.emit(RuntimeEvent::ContextSummarizationCompleted {
                    trace_id,
                    session_id: self.session_id.clone(),
                    summary,
                    kept_messages: rebuilt.len(),
                });
                Ok(rebuilt)
            }
            Err(e) => {
                let error = e.to_string();
                self.events.emit(RuntimeEvent::ContextSummarizationError {
                    trace_id,
                    session_id: self.session_id.clone(),
                    error: error.clone(),
                });
                Err(ControllerError::SummarizationFailed(error))
            }
        }
    }

    /// Resolve `call`'s origin and dispatch it. Errors at every layer are folded into an
    /// `is_error` [`ToolResult`] rather than propagated, per §4.8's "errors are serialized as
    /// strings into the tool result channel, not as exceptions".
    async fn dispatch_tool(
        &self,
        call: &NativeToolCall,
        tool_to_server: &HashMap<String, String>,
    ) -> ToolResult {
        let name = call.name.as_str();
        let trace_id = uuid::Uuid::new_v4().to_string();
        self.events.emit(RuntimeEvent::ToolCallStart {
            trace_id: trace_id.clone(),
            span_id: call.id.clone(),
            parent_id: None,
            session_id: self.session_id.clone(),
            tool_name: name.to_string(),
            call_id: call.id.clone(),
        });

        let result = if VIRTUAL_TOOL_NAMES.contains(&name) {
            self.virtual_tools.handle(name, call.arguments.clone()).await
        } else if self.custom_tools.contains(name) {
            if self.custom_tools.is_stream_callback(name) {
                match self.stream_dispatcher.read().await.as_ref() {
                    Some(dispatcher) => dispatcher.dispatch(&call.id, name, call.arguments.clone()).await,
                    None => ToolResult::error(format!(
                        "{} is a stream-callback tool but no gateway is attached",
                        name
                    )),
                }
            } else {
                match self.custom_tools.call(name, call.arguments.clone()).await {
                    Ok(result) => result,
                    Err(e) => ToolResult::error(e.to_string()),
                }
            }
        } else if let Some(server_name) = tool_to_server.get(name) {
            self.call_mcp_tool(server_name, name, call.arguments.clone()).await
        } else {
            ToolResult::error(format!("no known origin for tool {}", name))
        };

        self.events.emit(RuntimeEvent::ToolCallEnd {
            trace_id,
            span_id: call.id.clone(),
            parent_id: None,
            session_id: self.session_id.clone(),
            tool_name: name.to_string(),
            call_id: call.id.clone(),
            success: !result.is_error,
            error: if result.is_error { Some(result.content.clone()) } else { None },
        });

        result
    }

    async fn call_mcp_tool(&self, server_name: &str, tool_name: &str, arguments: Value) -> ToolResult {
        let Some(server_config) = self.server_configs.get(server_name) else {
            return ToolResult::error(format!("no configuration for server {}", server_name));
        };

        let client = match self
            .session_registry
            .get_or_create(&self.session_id, server_name, server_config)
            .await
        {
            Ok(client) => client,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        match client.call_tool(tool_name, arguments).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    /// Offload `result.content` to disk if it exceeds the configured threshold and return the
    /// text that actually belongs in history: the placeholder when offloaded, the content
    /// unchanged otherwise (including error content, which is never offloaded).
    async fn store_result(&self, tool_name: &str, result: ToolResult) -> String {
        if result.is_error {
            return result.content;
        }

        match context_manager::offload_if_large(
            &self.config.offload_dir,
            tool_name,
            &result.content,
            self.config.large_output_threshold,
        )
        .await
        {
            Ok(Some(reference)) => context_manager::offload_placeholder(&reference),
            Ok(None) => result.content,
            Err(e) => {
                log::warn!("controller: offload failed for {}: {}", tool_name, e);
                result.content
            }
        }
    }
}

/// Crude token estimate (characters / 4) used only to decide whether token-threshold
/// summarization should trigger; actual billed usage comes from the provider's response.
fn estimate_token_count(history: &[Message]) -> usize {
    history.iter().map(|m| m.content.len() / 4).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    struct ScriptedClient {
        responses: std::sync::Mutex<Vec<Message>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Message>) -> Self {
            Self { responses: std::sync::Mutex::new(responses), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ClientWrapper for ScriptedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err("no more scripted responses".into());
            }
            Ok(responses.remove(0))
        }

        fn model_name(&self) -> &str {
            "scripted-model"
        }
    }

    fn text_message(content: &str) -> Message {
        Message { role: Role::Assistant, content: Arc::from(content), tool_calls: vec![] }
    }

    fn tool_call_message(call_id: &str, tool_name: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: call_id.to_string(),
                name: tool_name.to_string(),
                arguments: serde_json::json!({"expression": "2 + 2"}),
            }],
        }
    }

    fn test_controller(client: Arc<dyn ClientWrapper>) -> Controller {
        let mut custom_tools = CustomToolRegistry::new();
        custom_tools.register_calculator().unwrap();

        Controller::new(
            client,
            Arc::new(SessionRegistry::new(rmcp::model::Implementation {
                name: "agentdock-tests".to_string(),
                version: "0.0.0".to_string(),
            })),
            Arc::new(HashMap::new()),
            Arc::new(custom_tools),
            Arc::new(NullVirtualToolHandler),
            None,
            Arc::new(EventEmitter::new()),
            "test-session",
            ControllerConfig::default(),
        )
    }

    fn base_request() -> (HashMap<String, String>, CancellationToken) {
        (HashMap::new(), CancellationToken::new())
    }

    #[tokio::test]
    async fn run_turn_returns_final_text_with_no_tool_calls() {
        let client: Arc<dyn ClientWrapper> =
            Arc::new(ScriptedClient::new(vec![text_message("hello there")]));
        let controller = test_controller(client);
        let (tool_to_server, cancel) = base_request();

        let outcome = controller
            .run_turn(TurnRequest {
                history: vec![],
                question: Some("hi".to_string()),
                tool_to_server: &tool_to_server,
                tools_for_llm: vec![],
                temperature: 0.0,
                cancel,
            })
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "hello there");
        // user question + final assistant message
        assert_eq!(outcome.history.len(), 2);
    }

    #[tokio::test]
    async fn run_turn_dispatches_custom_tool_then_finishes() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![
            tool_call_message("call_1", "calculator"),
            text_message("the answer is 4"),
        ]));
        let controller = test_controller(client);
        let (tool_to_server, cancel) = base_request();

        let outcome = controller
            .run_turn(TurnRequest {
                history: vec![],
                question: Some("what is 2 + 2?".to_string()),
                tool_to_server: &tool_to_server,
                tools_for_llm: vec![],
                temperature: 0.0,
                cancel,
            })
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "the answer is 4");
        let tool_message = outcome
            .history
            .iter()
            .find(|m| matches!(m.role, Role::Tool { .. }))
            .unwrap();
        assert_eq!(&*tool_message.content, "4");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_as_error_result_not_exception() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![
            tool_call_message("call_1", "nonexistent_tool"),
            text_message("done"),
        ]));
        let controller = test_controller(client);
        let (tool_to_server, cancel) = base_request();

        let outcome = controller
            .run_turn(TurnRequest {
                history: vec![],
                question: Some("go".to_string()),
                tool_to_server: &tool_to_server,
                tools_for_llm: vec![],
                temperature: 0.0,
                cancel,
            })
            .await
            .unwrap();

        let tool_message = outcome
            .history
            .iter()
            .find(|m| matches!(m.role, Role::Tool { .. }))
            .unwrap();
        assert!(tool_message.content.contains("no known origin"));
    }

    #[tokio::test]
    async fn cancellation_before_first_call_preserves_the_question() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![text_message("unused")]));
        let controller = test_controller(client);
        let (tool_to_server, cancel) = base_request();
        cancel.cancel();

        let outcome = controller
            .run_turn(TurnRequest {
                history: vec![],
                question: Some("hi".to_string()),
                tool_to_server: &tool_to_server,
                tools_for_llm: vec![],
                temperature: 0.0,
                cancel,
            })
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.final_text, "");
        assert_eq!(outcome.history.len(), 1);
        assert!(matches!(outcome.history[0].role, Role::User));
    }

    #[tokio::test]
    async fn cancellation_mid_turn_preserves_the_completed_tool_result() {
        use crate::custom_tools::{ExecutionBinding, FnToolFunction};

        let (tool_to_server, cancel) = base_request();
        let cancel_for_tool = cancel.clone();

        let mut custom_tools = CustomToolRegistry::new();
        custom_tools.register_calculator().unwrap();
        custom_tools
            .register(
                "cancel_me",
                "cancels the conversation as a side effect of running",
                vec![],
                "test",
                ExecutionBinding::Function(Arc::new(FnToolFunction(move |_args: Value| {
                    let cancel = cancel_for_tool.clone();
                    async move {
                        cancel.cancel();
                        ToolResult::ok("cancelled")
                    }
                }))),
            )
            .unwrap();

        let two_calls = Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![
                NativeToolCall {
                    id: "call_1".to_string(),
                    name: "cancel_me".to_string(),
                    arguments: serde_json::json!({}),
                },
                NativeToolCall {
                    id: "call_2".to_string(),
                    name: "calculator".to_string(),
                    arguments: serde_json::json!({"expression": "2 + 2"}),
                },
            ],
        };
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![two_calls]));

        let controller = Controller::new(
            client,
            Arc::new(SessionRegistry::new(rmcp::model::Implementation {
                name: "agentdock-tests".to_string(),
                version: "0.0.0".to_string(),
            })),
            Arc::new(HashMap::new()),
            Arc::new(custom_tools),
            Arc::new(NullVirtualToolHandler),
            None,
            Arc::new(EventEmitter::new()),
            "test-session",
            ControllerConfig::default(),
        );

        let outcome = controller
            .run_turn(TurnRequest {
                history: vec![],
                question: Some("go".to_string()),
                tool_to_server: &tool_to_server,
                tools_for_llm: vec![],
                temperature: 0.0,
                cancel,
            })
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.final_text, "");
        let tool_results: Vec<_> =
            outcome.history.iter().filter(|m| matches!(m.role, Role::Tool { .. })).collect();
        assert_eq!(tool_results.len(), 1);
        assert_eq!(&*tool_results[0].content, "cancelled");
    }

    #[tokio::test]
    async fn max_turns_forces_finalization_with_one_more_llm_call() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![
            text_message("summary of everything so far"),
            text_message("final forced answer"),
        ]));
        let controller = test_controller(client);
        let mut config = ControllerConfig::default();
        config.max_turns = 0;
        let controller = Controller { config, ..controller };
        let (tool_to_server, cancel) = base_request();

        let outcome = controller
            .run_turn(TurnRequest {
                history: vec![],
                question: Some("hi".to_string()),
                tool_to_server: &tool_to_server,
                tools_for_llm: vec![],
                temperature: 0.0,
                cancel,
            })
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "final forced answer");
    }
}
