//! End-to-end coverage of Agent construction, the Agent Manager's lifecycle registry, and the
//! custom/virtual tool surface, running against a zero-server configuration plus a scripted
//! LLM client so no real MCP subprocess or network call is required.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agentdock::agent::Agent;
use agentdock::agent_manager::{AgentManager, CreateAgentRequest};
use agentdock::catalog::Catalog;
use agentdock::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use agentdock::config::{AgentConfig, EnvConfig};
use agentdock::custom_tools::CustomToolRegistry;
use agentdock::event::EventEmitter;
use agentdock::prompt_builder::PromptMode;
use agentdock::session_registry::SessionRegistry;
use async_trait::async_trait;
use rmcp::model::Implementation;
use tokio_util::sync::CancellationToken;

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

fn test_impl() -> Implementation {
    Implementation { name: "agentdock-tests".to_string(), version: "0.0.0".to_string() }
}

fn empty_mcp_config() -> tempfile::TempPath {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, br#"{"mcpServers": {}}"#).unwrap();
    file.into_temp_path()
}

fn env_config(dir: &tempfile::TempDir) -> EnvConfig {
    EnvConfig {
        cache_dir: dir.path().join("cache"),
        cache_ttl_minutes: 60,
        generated_dir: dir.path().join("generated"),
        api_url: None,
        api_token: None,
        session_id: Some("test-session".to_string()),
    }
}

#[tokio::test]
async fn agent_answers_a_question_with_no_tool_servers() {
    let config_path = empty_mcp_config();
    let dir = tempfile::tempdir().unwrap();
    let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![text_message("hello there")]));

    let agent = Agent::build(
        &config_path,
        PromptMode::DirectTool,
        "You are a helpful assistant.",
        AgentConfig::default(),
        &env_config(&dir),
        client,
        test_impl(),
        Arc::new(SessionRegistry::new(test_impl())),
        Arc::new(Catalog::new(dir.path().join("cache"), std::time::Duration::from_secs(3600))),
        Arc::new(CustomToolRegistry::new()),
        Arc::new(EventEmitter::new()),
    )
    .await
    .unwrap();

    let outcome = agent.ask("hi", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.final_text, "hello there");

    let capabilities = agent.capabilities();
    assert!(capabilities.tools.is_empty());
    assert!(capabilities.servers.is_empty());

    let usage = agent.token_usage().await;
    assert_eq!(usage.llm_calls, 1);
}

#[tokio::test]
async fn agent_manager_tracks_and_destroys_a_built_agent() {
    let config_path = empty_mcp_config();
    let dir = tempfile::tempdir().unwrap();
    let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![text_message("ok")]));

    let manager = AgentManager::new(
        Arc::new(SessionRegistry::new(test_impl())),
        Arc::new(Catalog::new(dir.path().join("cache"), std::time::Duration::from_secs(3600))),
        Arc::new(CustomToolRegistry::new()),
        Arc::new(EventEmitter::new()),
    );

    let agent_id = manager
        .create_agent(CreateAgentRequest {
            mcp_config_path: config_path.to_path_buf(),
            mode: PromptMode::DirectTool,
            base_prompt: "You are a helpful assistant.".to_string(),
            agent_config: AgentConfig::default(),
            env_config: env_config(&dir),
            client,
            client_impl: test_impl(),
        })
        .await
        .unwrap();

    assert_eq!(manager.list_agents().await, vec![agent_id.clone()]);
    let capabilities = manager.get_capabilities(&agent_id).await.unwrap();
    assert!(capabilities.tools.is_empty());

    assert!(manager.destroy_agent(&agent_id).await);
    assert!(manager.get_agent(&agent_id).await.is_none());
    assert!(!manager.destroy_agent(&agent_id).await);
}

#[tokio::test]
async fn calculator_custom_tool_is_dispatched_through_a_turn() {
    let config_path = empty_mcp_config();
    let dir = tempfile::tempdir().unwrap();

    let mut custom_tools = CustomToolRegistry::new();
    custom_tools.register_calculator().unwrap();

    let tool_call = Message {
        role: Role::Assistant,
        content: Arc::from(""),
        tool_calls: vec![agentdock::client_wrapper::NativeToolCall {
            id: "call_1".to_string(),
            name: "calculator".to_string(),
            arguments: serde_json::json!({"expression": "6 * 7"}),
        }],
    };
    let client: Arc<dyn ClientWrapper> =
        Arc::new(ScriptedClient::new(vec![tool_call, text_message("the answer is 42")]));

    let agent = Agent::build(
        &config_path,
        PromptMode::DirectTool,
        "You are a helpful assistant.",
        AgentConfig::default(),
        &env_config(&dir),
        client,
        test_impl(),
        Arc::new(SessionRegistry::new(test_impl())),
        Arc::new(Catalog::new(dir.path().join("cache"), std::time::Duration::from_secs(3600))),
        Arc::new(custom_tools),
        Arc::new(EventEmitter::new()),
    )
    .await
    .unwrap();

    let outcome = agent.ask("what is 6 times 7?", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.final_text, "the answer is 42");
    assert!(outcome.history.iter().any(|m| matches!(&m.role, Role::Tool { call_id } if call_id == "call_1")));
}
