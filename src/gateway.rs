//! Streaming Gateway (C13): a WebSocket front end onto a registered [`Agent`].
//!
//! Each accepted connection binds to exactly one agent (looked up in the [`AgentManager`]) and
//! runs two independent loops coordinated by channels, per §9: a receive loop that reads
//! client-to-server frames and either starts a turn, completes a pending stream-callback tool
//! call, or cancels the in-flight turn; and a send loop that drains an outgoing channel and
//! writes every frame (runtime events, tool-call requests, the final answer) back to the socket.
//! The only state shared between them is the small mutex around the turn currently in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::agent_manager::AgentManager;
use crate::client_wrapper::{Message, Role};
use crate::controller::StreamCallbackDispatcher;
use crate::custom_tools::ToolResult;
use crate::error::GatewayError;
use crate::event::EventEmitter;

/// How long a stream-callback tool call waits for the client to post a matching `ToolResult`
/// before the dispatcher gives up and folds a timeout error into the tool's history entry.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Fan-out size for a connection's outgoing channel; one frame per runtime event, chunk, or tool
/// call in flight, which in practice never queues deeply since the send loop drains eagerly.
const OUTGOING_CHANNEL_CAPACITY: usize = 256;

/// A message as it crosses the wire: just a role tag and text, independent of the in-process
/// [`Message`] representation (which carries native tool calls `Arc<str>` content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let role = match &message.role {
            Role::System => "system".to_string(),
            Role::User => "user".to_string(),
            Role::Assistant => "assistant".to_string(),
            Role::Tool { call_id } => format!("tool:{}", call_id),
        };
        WireMessage { role, content: message.content.to_string() }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        let role = match wire.role.strip_prefix("tool:") {
            Some(call_id) => Role::Tool { call_id: call_id.to_string() },
            None => match wire.role.as_str() {
                "system" => Role::System,
                "assistant" => Role::Assistant,
                _ => Role::User,
            },
        };
        Message { role, content: Arc::from(wire.content), tool_calls: vec![] }
    }
}

/// A snapshot of accumulated token usage, serialized for [`ConversationResponse::FinalResponse`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One client-to-server frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConversationRequest {
    /// Ask a question. When `history` is omitted the agent starts from its own system prompt;
    /// when supplied, it replaces the agent's default starting history wholesale.
    #[serde(rename_all = "camelCase")]
    Question { text: String, history: Option<Vec<WireMessage>> },
    /// Completes a pending stream-callback tool call previously sent as `ToolCall`.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        #[serde(rename = "callID")]
        call_id: String,
        success: bool,
        result: Option<String>,
        error: Option<String>,
    },
    /// Cancels the turn currently in flight on this connection, if any.
    #[serde(rename_all = "camelCase")]
    Cancel { reason: Option<String> },
}

/// One server-to-client frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConversationResponse {
    /// A runtime event (tool start/end, summarization lifecycle, cache eviction) forwarded
    /// verbatim as its debug representation, for observability-minded clients.
    #[serde(rename_all = "camelCase")]
    AgentEvent { event: String },
    /// An incremental piece of assistant text.
    #[serde(rename_all = "camelCase")]
    TextChunk { text: String, is_thinking: bool },
    /// A stream-callback tool call the client must execute and answer with a `ToolResult`.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        #[serde(rename = "callID")]
        call_id: String,
        tool_name: String,
        arguments: Value,
        timeout_ms: u64,
    },
    /// The turn finished with a final assistant answer.
    #[serde(rename_all = "camelCase")]
    FinalResponse {
        response: String,
        updated_messages: Vec<WireMessage>,
        token_usage: WireUsage,
        duration_ms: u64,
    },
    /// Something went wrong; `fatal` means the connection is about to close.
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String, fatal: bool },
}

/// Shared state handed to every accepted connection.
pub struct GatewayState {
    agent_manager: Arc<AgentManager>,
}

impl GatewayState {
    pub fn new(agent_manager: Arc<AgentManager>) -> Self {
        Self { agent_manager }
    }
}

/// Build the router exposing `/agents/:agent_id/stream` as a WebSocket upgrade endpoint.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/agents/{agent_id}/stream", get(upgrade)).with_state(state)
}

async fn upgrade(
    Path(agent_id): Path<String>,
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, agent_id, state))
}

/// Dispatches stream-callback custom tool calls through a connection's outgoing channel and
/// resumes whichever task is awaiting the matching `ToolResult`.
struct GatewayDispatcher {
    out_tx: mpsc::Sender<ConversationResponse>,
    pending: DashMap<String, oneshot::Sender<ToolResult>>,
}

impl GatewayDispatcher {
    fn new(out_tx: mpsc::Sender<ConversationResponse>) -> Self {
        Self { out_tx, pending: DashMap::new() }
    }

    /// Resolve a pending call from an incoming `ToolResult` frame. Returns `false` if `call_id`
    /// matched nothing, so the caller can surface [`GatewayError::UnmatchedCallId`].
    fn resolve(&self, call_id: &str, result: ToolResult) -> bool {
        match self.pending.remove(call_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl StreamCallbackDispatcher for GatewayDispatcher {
    async fn dispatch(&self, call_id: &str, tool_name: &str, arguments: Value) -> ToolResult {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.to_string(), tx);

        let sent = self
            .out_tx
            .send(ConversationResponse::ToolCall {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
                timeout_ms: TOOL_CALL_TIMEOUT.as_millis() as u64,
            })
            .await;
        if sent.is_err() {
            self.pending.remove(call_id);
            return ToolResult::error("gateway connection closed before the tool call could be sent");
        }

        match tokio::time::timeout(TOOL_CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => ToolResult::error("gateway dropped the pending tool call"),
            Err(_) => {
                self.pending.remove(call_id);
                ToolResult::error(format!("tool call {} timed out waiting for a result", call_id))
            }
        }
    }
}

async fn handle_connection(socket: WebSocket, agent_id: String, state: Arc<GatewayState>) {
    let agent = match state.agent_manager.get_agent(&agent_id).await {
        Some(agent) => agent,
        None => {
            close_with_error(
                socket,
                "unknown_agent",
                GatewayError::UnknownAgent(agent_id).to_string(),
            )
            .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ConversationResponse>(OUTGOING_CHANNEL_CAPACITY);
    let dispatcher = Arc::new(GatewayDispatcher::new(out_tx.clone()));
    agent.attach_stream_dispatcher(Some(dispatcher.clone())).await;

    let events = state.agent_manager.events();
    let event_forwarder = spawn_event_forwarder(events.clone(), out_tx.clone());

    // Only one turn runs at a time per connection; this mutex never wraps the turn itself, only
    // the handoff of its cancellation token.
    let active_cancel: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

    let send_loop = tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            let payload = match serde_json::to_string(&response) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("gateway: failed to serialize response: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let request: ConversationRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let _ = out_tx
                    .send(ConversationResponse::Error {
                        code: "bad_request".to_string(),
                        message: e.to_string(),
                        fatal: false,
                    })
                    .await;
                continue;
            }
        };

        match request {
            ConversationRequest::Question { text, history } => {
                spawn_turn(agent.clone(), text, history, out_tx.clone(), active_cancel.clone());
            }
            ConversationRequest::ToolResult { call_id, success, result, error } => {
                let outcome = if success {
                    ToolResult::ok(result.unwrap_or_default())
                } else {
                    ToolResult::error(error.unwrap_or_default())
                };
                if !dispatcher.resolve(&call_id, outcome) {
                    let _ = out_tx
                        .send(ConversationResponse::Error {
                            code: "unmatched_call_id".to_string(),
                            message: GatewayError::UnmatchedCallId(call_id).to_string(),
                            fatal: false,
                        })
                        .await;
                }
            }
            ConversationRequest::Cancel { reason } => {
                if let Some(cancel) = active_cancel.lock().await.take() {
                    log::info!(
                        "gateway: cancelling agent {} turn ({})",
                        agent_id,
                        reason.unwrap_or_else(|| "no reason given".to_string())
                    );
                    cancel.cancel();
                }
            }
        }
    }

    agent.attach_stream_dispatcher(None).await;
    events.unsubscribe(event_forwarder.subscriber_id);
    event_forwarder.task.abort();
    drop(out_tx);
    let _ = send_loop.await;
}

struct EventForwarder {
    subscriber_id: crate::event::SubscriberId,
    task: tokio::task::JoinHandle<()>,
}

/// Subscribes to every runtime event and relays it to this connection as an `AgentEvent` frame.
/// Shared across every connection on the gateway rather than filtered per agent, since
/// [`crate::event::RuntimeEvent`] does not currently carry an agent id, only a session id.
fn spawn_event_forwarder(
    events: Arc<EventEmitter>,
    out_tx: mpsc::Sender<ConversationResponse>,
) -> EventForwarder {
    let (subscriber_id, mut rx) = events.subscribe(OUTGOING_CHANNEL_CAPACITY);
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let response = ConversationResponse::AgentEvent { event: format!("{:?}", event) };
            if out_tx.send(response).await.is_err() {
                break;
            }
        }
    });
    EventForwarder { subscriber_id, task }
}

fn spawn_turn(
    agent: Arc<Agent>,
    text: String,
    history: Option<Vec<WireMessage>>,
    out_tx: mpsc::Sender<ConversationResponse>,
    active_cancel: Arc<Mutex<Option<CancellationToken>>>,
) {
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        *active_cancel.lock().await = Some(cancel.clone());

        let started = Instant::now();
        let outcome = match history {
            Some(wire_history) => {
                let history: Vec<Message> = wire_history.into_iter().map(Message::from).collect();
                agent.ask_with_history(history, cancel).await
            }
            None => agent.ask(text, cancel).await,
        };
        *active_cancel.lock().await = None;

        let response = match outcome {
            Ok(outcome) if outcome.cancelled => ConversationResponse::Error {
                code: "cancelled".to_string(),
                message: format!("turn cancelled after {} history messages", outcome.history.len()),
                fatal: false,
            },
            Ok(outcome) => {
                let usage = agent.token_usage().await;
                ConversationResponse::FinalResponse {
                    response: outcome.final_text,
                    updated_messages: outcome.history.iter().map(WireMessage::from).collect(),
                    token_usage: WireUsage {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.total_tokens,
                    },
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => ConversationResponse::Error {
                code: "turn_failed".to_string(),
                message: e.to_string(),
                fatal: false,
            },
        };
        let _ = out_tx.send(response).await;
    });
}

async fn close_with_error(socket: WebSocket, code: &str, message: String) {
    let (mut sink, _stream) = socket.split();
    let response = ConversationResponse::Error { code: code.to_string(), message, fatal: true };
    if let Ok(payload) = serde_json::to_string(&response) {
        let _ = sink.send(WsMessage::Text(payload)).await;
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_round_trips_through_message() {
        let message = Message { role: Role::User, content: Arc::from("hello"), tool_calls: vec![] };
        let wire = WireMessage::from(&message);
        assert_eq!(wire.role, "user");
        assert_eq!(wire.content, "hello");

        let back: Message = wire.into();
        assert!(matches!(back.role, Role::User));
        assert_eq!(&*back.content, "hello");
    }

    #[test]
    fn tool_role_round_trips_with_call_id() {
        let message = Message {
            role: Role::Tool { call_id: "call_1".to_string() },
            content: Arc::from("4"),
            tool_calls: vec![],
        };
        let wire = WireMessage::from(&message);
        assert_eq!(wire.role, "tool:call_1");

        let back: Message = wire.into();
        match back.role {
            Role::Tool { call_id } => assert_eq!(call_id, "call_1"),
            _ => panic!("expected a tool role"),
        }
    }

    #[test]
    fn conversation_request_parses_question() {
        let parsed: ConversationRequest =
            serde_json::from_str(r#"{"type":"question","text":"hi"}"#).unwrap();
        match parsed {
            ConversationRequest::Question { text, history } => {
                assert_eq!(text, "hi");
                assert!(history.is_none());
            }
            _ => panic!("expected a question request"),
        }
    }

    #[test]
    fn conversation_request_parses_cancel() {
        let parsed: ConversationRequest =
            serde_json::from_str(r#"{"type":"cancel","reason":"user left"}"#).unwrap();
        match parsed {
            ConversationRequest::Cancel { reason } => assert_eq!(reason.as_deref(), Some("user left")),
            _ => panic!("expected a cancel request"),
        }
    }

    #[tokio::test]
    async fn dispatcher_resolve_returns_false_for_unknown_call_id() {
        let (tx, _rx) = mpsc::channel(1);
        let dispatcher = GatewayDispatcher::new(tx);
        assert!(!dispatcher.resolve("nonexistent", ToolResult::ok("x")));
    }

    #[tokio::test]
    async fn dispatcher_resolve_completes_pending_call() {
        let (tx, _rx) = mpsc::channel(1);
        let dispatcher = Arc::new(GatewayDispatcher::new(tx));
        let d = dispatcher.clone();
        let handle = tokio::spawn(async move { d.dispatch("call_1", "search", Value::Null).await });

        // Give the dispatch task a chance to register the pending slot before resolving it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.resolve("call_1", ToolResult::ok("done")));

        let result = handle.await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "done");
    }
}
