//! Agent (C11): one configured, ready-to-question conversation driver.
//!
//! [`Agent::build`] loads an MCP configuration, discovers tools from every selected server in
//! parallel (isolating per-server discovery failures rather than failing construction), resolves
//! the effective toolset against the Tool Catalog's primary/duplicate ownership tags, builds the
//! system prompt, and wires a [`Controller`] with a concrete [`VirtualToolHandler`] bound to this
//! agent's own state. `ask`/`ask_with_history`/`ask_structured` are the three public entry points
//! a caller drives a built agent through.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::Implementation;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::artifact_generator::{self, ArtifactTool};
use crate::catalog::{CachedTool, Catalog, Ownership};
use crate::client_wrapper::{ClientWrapper, Message, Role, TokenUsage, ToolDefinition};
use crate::config::{self, AgentConfig, EnvConfig, ServerConfig};
use crate::context_manager;
use crate::controller::{
    Controller, ControllerConfig, StreamCallbackDispatcher, TurnRequest, VirtualToolHandler,
};
use crate::custom_tools::{CustomToolRegistry, ToolResult};
use crate::error::{CatalogError, ConfigError, ControllerError};
use crate::event::EventEmitter;
use crate::prompt_builder::{self, PromptInputs, PromptMode};
use crate::provider_client::McpToolDescriptor;
use crate::schema_normalizer;
use crate::session_registry::SessionRegistry;

/// Errors raised while building or driving an [`Agent`].
#[derive(Debug)]
pub enum AgentError {
    Config(ConfigError),
    Controller(ControllerError),
    /// `ask_structured` was cancelled before it could produce a JSON projection; unlike
    /// `ask`/`ask_with_history` there's no `Value` that can represent partial progress, so this
    /// is surfaced as an error instead of an `AskOutcome`.
    Cancelled,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Config(e) => write!(f, "{}", e),
            AgentError::Controller(e) => write!(f, "{}", e),
            AgentError::Cancelled => write!(f, "conversation cancelled"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::Config(e)
    }
}

impl From<ControllerError> for AgentError {
    fn from(e: ControllerError) -> Self {
        AgentError::Controller(e)
    }
}

/// Token/cost accounting accumulated across every LLM call an agent makes, including
/// summarization passes run internally by the Controller.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub llm_calls: u64,
}

impl UsageAccumulator {
    fn record(&mut self, usage: &TokenUsage) {
        self.prompt_tokens += usage.input_tokens as u64;
        self.completion_tokens += usage.output_tokens as u64;
        self.total_tokens += usage.total_tokens as u64;
        self.llm_calls += 1;
    }
}

/// Per-1000-token USD pricing, for [`Agent::token_usage_with_pricing`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenPricing {
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
}

/// Outcome of one `ask`/`ask_with_history` call.
pub struct AskOutcome {
    /// Empty when `cancelled` is `true`.
    pub final_text: String,
    pub history: Vec<Message>,
    /// Set when the caller's `CancellationToken` fired before a final answer was produced;
    /// `history` still holds every message built up to that point.
    pub cancelled: bool,
}

/// The effective tool/server surface of a built agent, as returned by the Agent Manager's
/// `GetCapabilities`.
#[derive(Debug, Clone, Default)]
pub struct AgentCapabilities {
    pub tools: Vec<String>,
    pub servers: Vec<String>,
}

/// One candidate tool in the union of every selected server's discovered tools, before ownership
/// resolution collapses same-named duplicates.
#[derive(Clone)]
struct CandidateTool {
    server_name: String,
    tool: CachedTool,
}

/// A fully constructed agent: an effective toolset, a system prompt, and a [`Controller`] wired
/// to dispatch against both.
pub struct Agent {
    controller: Controller,
    system_prompt: Message,
    tool_to_server: HashMap<String, String>,
    custom_tool_defs: Vec<ToolDefinition>,
    virtual_tool_defs: Vec<ToolDefinition>,
    effective_mcp_defs: Vec<(String, ToolDefinition)>,
    active_tools: Arc<Mutex<HashSet<String>>>,
    mode: PromptMode,
    temperature: f32,
    usage: Mutex<UsageAccumulator>,
}

impl Agent {
    /// Build an agent against `mcp_config_path`, restricted (if non-empty) to
    /// `agent_config.selected_servers`/`selected_tools`.
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        mcp_config_path: impl AsRef<Path>,
        mode: PromptMode,
        base_prompt: &str,
        agent_config: AgentConfig,
        env_config: &EnvConfig,
        client: Arc<dyn ClientWrapper>,
        client_impl: Implementation,
        session_registry: Arc<SessionRegistry>,
        catalog: Arc<Catalog>,
        custom_tools: Arc<CustomToolRegistry>,
        events: Arc<EventEmitter>,
    ) -> Result<Self, AgentError> {
        let session_id = env_config
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let merged = config::load_and_merge(mcp_config_path)?;
        let server_names: Vec<String> = if agent_config.selected_servers.is_empty() {
            merged.mcp_servers.keys().cloned().collect()
        } else {
            agent_config.selected_servers.clone()
        };

        let discoveries = futures_util::future::join_all(server_names.iter().map(|name| {
            let merged = &merged;
            let catalog = catalog.clone();
            let session_registry = session_registry.clone();
            let client_impl = client_impl.clone();
            let session_id = session_id.clone();
            async move {
                let Some(server_config) = merged.mcp_servers.get(name) else {
                    return (name.clone(), Vec::new());
                };
                match discover_server_tools(
                    &session_id,
                    name,
                    server_config,
                    &session_registry,
                    &catalog,
                    &client_impl,
                )
                .await
                {
                    Ok(tools) => (name.clone(), tools),
                    Err(e) => {
                        log::warn!("agent: discovery failed for server {}: {}", name, e);
                        (name.clone(), Vec::new())
                    }
                }
            }
        }))
        .await;

        let mut all_candidates: Vec<CandidateTool> = Vec::new();
        for (server_name, tools) in &discoveries {
            for tool in tools {
                all_candidates.push(CandidateTool {
                    server_name: server_name.clone(),
                    tool: tool.clone(),
                });
            }
        }

        let selected = apply_selection_filters(all_candidates, &agent_config);
        let effective = resolve_ownership(selected);

        let mut tool_to_server = HashMap::new();
        let mut effective_mcp_defs = Vec::new();
        let mut by_server: HashMap<String, Vec<&CandidateTool>> = HashMap::new();
        for candidate in &effective {
            tool_to_server.insert(candidate.tool.name.clone(), candidate.server_name.clone());
            effective_mcp_defs.push((
                candidate.tool.name.clone(),
                ToolDefinition {
                    name: candidate.tool.name.clone(),
                    description: candidate.tool.description.clone(),
                    parameters_schema: candidate.tool.input_schema.clone(),
                },
            ));
            by_server.entry(candidate.server_name.clone()).or_default().push(candidate);
        }

        let custom_tool_defs: Vec<ToolDefinition> = custom_tools
            .all_metadata()
            .into_iter()
            .map(|meta| ToolDefinition {
                name: meta.name.clone(),
                description: meta.description.clone(),
                parameters_schema: meta.parameters_schema(),
            })
            .collect();
        let tool_categories: Vec<String> =
            custom_tools.metadata_by_category().into_keys().collect();

        catalog.set_codegen_enabled(mode == PromptMode::CodeExecution);
        let base_url = env_config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:8080".to_string());
        let mut tool_structure_json: Option<String> = None;
        if catalog.codegen_enabled() {
            let mut structure = serde_json::Map::new();
            for (server_name, tools) in &by_server {
                let artifact_tools: Vec<ArtifactTool> = tools
                    .iter()
                    .map(|c| ArtifactTool {
                        name: &c.tool.name,
                        description: &c.tool.description,
                        input_schema: &c.tool.input_schema,
                    })
                    .collect();
                if let Err(e) = artifact_generator::write_artifacts_for_server(
                    &env_config.generated_dir,
                    server_name,
                    &artifact_tools,
                    &[],
                    &base_url,
                    true,
                )
                .await
                {
                    log::warn!("agent: artifact generation failed for {}: {}", server_name, e);
                }
                structure.insert(
                    server_name.clone(),
                    Value::Array(tools.iter().map(|c| Value::String(c.tool.name.clone())).collect()),
                );
            }
            tool_structure_json = serde_json::to_string_pretty(&Value::Object(structure)).ok();
        }

        let mut prompt_inventories = Vec::new();
        let mut resource_inventories = Vec::new();
        let connections = session_registry.session_connections(&session_id);
        for server_name in &server_names {
            if let Some(provider_client) = connections.get(server_name) {
                if let Ok(prompts) = provider_client.list_prompts().await {
                    prompt_inventories.push((server_name.clone(), prompts));
                }
                if let Ok(resources) = provider_client.list_resources().await {
                    let names: Vec<String> = resources
                        .iter()
                        .filter_map(|r| r.get("name").and_then(|n| n.as_str()).map(|s| s.to_string()))
                        .collect();
                    resource_inventories.push((server_name.clone(), names));
                }
            }
        }

        let prompt_text = agent_config
            .system_prompt_override
            .clone()
            .unwrap_or_else(|| base_prompt.to_string());
        let prompt_inputs = PromptInputs {
            mode,
            base_prompt: &prompt_text,
            server_prompt_inventories: &prompt_inventories,
            server_resource_inventories: &resource_inventories,
            discover_resource: true,
            discover_prompt: true,
            tool_structure_json: tool_structure_json.as_deref(),
            tool_categories: &tool_categories,
            context_offloading_enabled: agent_config.enable_context_offloading,
            now: chrono::Utc::now(),
        };
        let system_prompt_text = prompt_builder::build_system_prompt(&prompt_inputs);
        let system_prompt = Message {
            role: Role::System,
            content: Arc::from(system_prompt_text),
            tool_calls: vec![],
        };

        let virtual_tool_defs = virtual_tool_definitions(
            mode,
            !prompt_inventories.is_empty(),
            !resource_inventories.is_empty(),
            agent_config.enable_context_offloading,
        );

        let active_tools: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(if mode == PromptMode::ToolSearch {
            HashSet::new()
        } else {
            effective_mcp_defs.iter().map(|(name, _)| name.clone()).collect()
        }));

        let server_configs: Arc<HashMap<String, ServerConfig>> = Arc::new(merged.mcp_servers.clone());
        let offload_dir = PathBuf::from(".mcp_offload");

        let handler = Arc::new(AgentVirtualTools {
            session_registry: session_registry.clone(),
            server_configs: server_configs.clone(),
            session_id: session_id.clone(),
            offload_dir: offload_dir.clone(),
            generated_dir: env_config.generated_dir.clone(),
            mode,
            all_tools: effective_mcp_defs.clone(),
            active_tools: active_tools.clone(),
        });

        let controller_config = ControllerConfig {
            max_turns: agent_config.max_turns,
            large_output_threshold: context_manager::DEFAULT_LARGE_OUTPUT_THRESHOLD,
            keep_messages: context_manager::DEFAULT_KEEP_MESSAGES,
            force_finalize_on_max_turns: agent_config.force_finalize_on_max_turns,
            offload_dir,
            token_threshold: if agent_config.enable_context_summarization {
                Some(0.8)
            } else {
                None
            },
            context_window: 128_000,
        };

        let controller = Controller::new(
            client,
            session_registry,
            server_configs,
            custom_tools,
            handler,
            None,
            events,
            session_id,
            controller_config,
        );

        Ok(Self {
            controller,
            system_prompt,
            tool_to_server,
            custom_tool_defs,
            virtual_tool_defs,
            effective_mcp_defs,
            active_tools,
            mode,
            temperature: agent_config.temperature,
            usage: Mutex::new(UsageAccumulator::default()),
        })
    }

    /// Ask a single question against a fresh history (just the system prompt).
    pub async fn ask(
        &self,
        question: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<AskOutcome, AgentError> {
        self.run(Some(question.into()), vec![self.system_prompt.clone()], cancel).await
    }

    /// Continue an existing history (caller-supplied, including its own system prompt if any).
    pub async fn ask_with_history(
        &self,
        history: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<AskOutcome, AgentError> {
        self.run(None, history, cancel).await
    }

    /// Ask a question, then make one additional LLM call projecting the free-form answer into
    /// JSON matching `schema`.
    pub async fn ask_structured(
        &self,
        question: impl Into<String>,
        schema: Value,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError> {
        let free_form = self.ask(question, cancel.clone()).await?;
        if free_form.cancelled {
            return Err(AgentError::Cancelled);
        }

        let projection_prompt = format!(
            "Project your previous answer into JSON matching this schema exactly. Respond with \
only the JSON object, no prose, no markdown fences.\n{}",
            serde_json::to_string_pretty(&schema).unwrap_or_default()
        );
        let mut history = free_form.history;
        history.push(Message {
            role: Role::User,
            content: Arc::from(projection_prompt),
            tool_calls: vec![],
        });

        let tools_for_llm = self.tools_for_llm().await;
        let outcome = self
            .controller
            .run_turn(TurnRequest {
                history,
                question: None,
                tool_to_server: &self.tool_to_server,
                tools_for_llm,
                temperature: 0.0,
                cancel,
            })
            .await?;
        self.record_usage(&outcome.usage).await;
        if outcome.cancelled {
            return Err(AgentError::Cancelled);
        }

        serde_json::from_str(&outcome.final_text).map_err(|e| {
            AgentError::Controller(ControllerError::Llm(format!(
                "structured projection was not valid JSON: {}",
                e
            )))
        })
    }

    /// (Re)bind the dispatcher used for stream-callback custom tools, e.g. when a Streaming
    /// Gateway connection attaches to or detaches from this agent.
    pub async fn attach_stream_dispatcher(
        &self,
        dispatcher: Option<Arc<dyn StreamCallbackDispatcher>>,
    ) {
        self.controller.set_stream_dispatcher(dispatcher).await;
    }

    /// Derive `(server:tool, servers)` from the effective toolset, for the Agent Manager's
    /// `GetCapabilities`.
    pub fn capabilities(&self) -> AgentCapabilities {
        let mut servers: Vec<String> = self.tool_to_server.values().cloned().collect();
        servers.sort();
        servers.dedup();
        let mut tools: Vec<String> = self
            .tool_to_server
            .iter()
            .map(|(tool, server)| format!("{}:{}", server, tool))
            .collect();
        tools.sort();
        AgentCapabilities { tools, servers }
    }

    pub async fn token_usage(&self) -> UsageAccumulator {
        self.usage.lock().await.clone()
    }

    pub async fn token_usage_with_pricing(&self, pricing: TokenPricing) -> (UsageAccumulator, f64) {
        let usage = self.usage.lock().await.clone();
        let cost = (usage.prompt_tokens as f64 / 1000.0) * pricing.prompt_cost_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * pricing.completion_cost_per_1k;
        (usage, cost)
    }

    async fn run(
        &self,
        question: Option<String>,
        history: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<AskOutcome, AgentError> {
        let tools_for_llm = self.tools_for_llm().await;
        let outcome = self
            .controller
            .run_turn(TurnRequest {
                history,
                question,
                tool_to_server: &self.tool_to_server,
                tools_for_llm,
                temperature: self.temperature,
                cancel,
            })
            .await?;
        self.record_usage(&outcome.usage).await;
        Ok(AskOutcome {
            final_text: outcome.final_text,
            history: outcome.history,
            cancelled: outcome.cancelled,
        })
    }

    async fn record_usage(&self, usages: &[TokenUsage]) {
        let mut usage = self.usage.lock().await;
        for u in usages {
            usage.record(u);
        }
    }

    /// The toolset advertised to the LLM on the next call: custom tools and reserved virtual
    /// tools are always present; MCP tools are filtered to the active set (all of them, unless
    /// in `ToolSearch` mode where `add_tool` grows the set at runtime).
    async fn tools_for_llm(&self) -> Vec<ToolDefinition> {
        let active = self.active_tools.lock().await;
        let mut defs = self.custom_tool_defs.clone();
        defs.extend(self.virtual_tool_defs.clone());
        if self.mode == PromptMode::ToolSearch {
            defs.extend(
                self.effective_mcp_defs
                    .iter()
                    .filter(|(name, _)| active.contains(name))
                    .map(|(_, def)| def.clone()),
            );
        } else {
            defs.extend(self.effective_mcp_defs.iter().map(|(_, def)| def.clone()));
        }
        defs
    }
}

async fn discover_server_tools(
    session_id: &str,
    server_name: &str,
    server_config: &ServerConfig,
    session_registry: &SessionRegistry,
    catalog: &Catalog,
    client_impl: &Implementation,
) -> Result<Vec<CachedTool>, CatalogError> {
    let config_value =
        serde_json::to_value(server_config).map_err(|e| CatalogError::Serde(e.to_string()))?;
    let config_hash = crate::catalog::hash_config(&config_value);

    if let Some(entry) = catalog.get(server_name, &config_hash).await {
        return Ok(entry.tools);
    }

    let client = session_registry
        .get_or_create(session_id, server_name, server_config)
        .await
        .map_err(|e| CatalogError::Io(e.to_string()))?;
    let discovered = client
        .list_tools()
        .await
        .map_err(|e| CatalogError::Io(e.to_string()))?;

    let normalized: Vec<McpToolDescriptor> = discovered
        .into_iter()
        .map(|t| {
            let (schema, _stats) = schema_normalizer::normalize(&t.input_schema);
            McpToolDescriptor {
                name: t.name,
                description: t.description,
                input_schema: schema,
            }
        })
        .collect();

    let entry = catalog.put(server_name, &config_hash, normalized).await?;
    Ok(entry.tools)
}

/// Apply `selectedTools`/`selectedServers` filters. A `selectedTools` entry of the form
/// `server:toolName` always wins; a `selectedServers` entry keeps every tool from that server
/// *unless* at least one `selectedTools` entry names that same server, in which case only the
/// explicitly named tools survive from it. With neither filter set, every discovered tool passes.
fn apply_selection_filters(candidates: Vec<CandidateTool>, agent_config: &AgentConfig) -> Vec<CandidateTool> {
    if agent_config.selected_servers.is_empty() && agent_config.selected_tools.is_empty() {
        return candidates;
    }

    let explicit_tools: HashSet<(String, String)> = agent_config
        .selected_tools
        .iter()
        .filter_map(|spec| {
            let mut parts = spec.splitn(2, ':');
            let server = parts.next()?.to_string();
            let tool = parts.next()?.to_string();
            Some((server, tool))
        })
        .collect();
    let overridden_servers: HashSet<&str> =
        explicit_tools.iter().map(|(server, _)| server.as_str()).collect();
    let selected_servers: HashSet<&str> =
        agent_config.selected_servers.iter().map(|s| s.as_str()).collect();

    candidates
        .into_iter()
        .filter(|c| {
            let key = (c.server_name.clone(), c.tool.name.clone());
            if explicit_tools.contains(&key) {
                return true;
            }
            selected_servers.contains(c.server_name.as_str())
                && !overridden_servers.contains(c.server_name.as_str())
        })
        .collect()
}

/// Collapse same-named duplicates to the entry the Tool Catalog tagged `Primary`. If the primary
/// holder for a name isn't part of the selected union, every candidate under that name is dropped
/// rather than silently promoting a duplicate, so the effective toolset never depends on which
/// servers happened to be selected.
fn resolve_ownership(candidates: Vec<CandidateTool>) -> Vec<CandidateTool> {
    let mut by_name: HashMap<String, Vec<CandidateTool>> = HashMap::new();
    for candidate in candidates {
        by_name.entry(candidate.tool.name.clone()).or_default().push(candidate);
    }

    let mut effective = Vec::new();
    for group in by_name.into_values() {
        if let Some(primary) = group.into_iter().find(|c| c.tool.ownership == Ownership::Primary) {
            effective.push(primary);
        }
    }
    effective
}

fn virtual_tool_definitions(
    mode: PromptMode,
    has_prompts: bool,
    has_resources: bool,
    offloading_enabled: bool,
) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    match mode {
        PromptMode::CodeExecution => {
            defs.push(ToolDefinition {
                name: "discover_code_files".to_string(),
                description: "List the generated tool stub files available to call from code."
                    .to_string(),
                parameters_schema: serde_json::json!({"type": "object", "properties": {}}),
            });
            defs.push(ToolDefinition {
                name: "write_code".to_string(),
                description: "Save a named code snippet alongside the generated tool stubs."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "filename": {"type": "string"},
                        "content": {"type": "string"},
                    },
                    "required": ["filename", "content"],
                }),
            });
            return defs;
        }
        PromptMode::ToolSearch => {
            defs.push(ToolDefinition {
                name: "search_tools".to_string(),
                description: "Search the full tool catalog for tools relevant to a query."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"],
                }),
            });
            defs.push(ToolDefinition {
                name: "add_tool".to_string(),
                description: "Add a tool found by search_tools to the active toolset."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "name": {"type": "string"},
                    },
                    "required": ["server", "name"],
                }),
            });
        }
        PromptMode::DirectTool => {}
    }

    if has_prompts {
        defs.push(ToolDefinition {
            name: "get_prompt".to_string(),
            description: "Retrieve a named prompt template from a connected server.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string"},
                    "name": {"type": "string"},
                    "arguments": {"type": "object"},
                },
                "required": ["server", "name"],
            }),
        });
    }
    if has_resources {
        defs.push(ToolDefinition {
            name: "get_resource".to_string(),
            description: "Retrieve a named resource from a connected server.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string"},
                    "uri": {"type": "string"},
                },
                "required": ["server", "uri"],
            }),
        });
    }
    if offloading_enabled {
        defs.push(ToolDefinition {
            name: "read_large_output".to_string(),
            description: "Read a byte range of an offloaded tool output.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string"},
                    "start": {"type": "integer"},
                    "end": {"type": "integer"},
                },
                "required": ["filename", "start", "end"],
            }),
        });
        defs.push(ToolDefinition {
            name: "search_large_output".to_string(),
            description: "Search an offloaded tool output for lines matching a pattern."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string"},
                    "pattern": {"type": "string"},
                    "case_sensitive": {"type": "boolean"},
                    "max_results": {"type": "integer"},
                },
                "required": ["filename", "pattern"],
            }),
        });
        defs.push(ToolDefinition {
            name: "query_large_output".to_string(),
            description: "Run a jq-lite query against a JSON offloaded tool output.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string"},
                    "query": {"type": "string"},
                    "compact": {"type": "boolean"},
                    "raw": {"type": "boolean"},
                },
                "required": ["filename", "query"],
            }),
        });
    }

    defs
}

/// The Controller's seam into Agent-owned state: prompt/resource access, large-output accessors,
/// tool search/activation, and (in code-execution mode) generated-file listing/writing.
struct AgentVirtualTools {
    session_registry: Arc<SessionRegistry>,
    server_configs: Arc<HashMap<String, ServerConfig>>,
    session_id: String,
    offload_dir: PathBuf,
    generated_dir: PathBuf,
    mode: PromptMode,
    all_tools: Vec<(String, ToolDefinition)>,
    active_tools: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl VirtualToolHandler for AgentVirtualTools {
    async fn handle(&self, name: &str, arguments: Value) -> ToolResult {
        match name {
            "get_prompt" => self.get_prompt(arguments).await,
            "get_resource" => self.get_resource(arguments).await,
            "read_large_output" => self.read_large_output(arguments).await,
            "search_large_output" => self.search_large_output(arguments).await,
            "query_large_output" => self.query_large_output(arguments).await,
            "search_tools" => self.search_tools(arguments).await,
            "add_tool" => self.add_tool(arguments).await,
            "discover_code_files" => self.discover_code_files().await,
            "write_code" => self.write_code(arguments).await,
            other => ToolResult::error(format!("unrecognized virtual tool {}", other)),
        }
    }
}

fn string_arg(arguments: &Value, field: &str) -> Result<String, ToolResult> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| ToolResult::error(format!("missing required argument: {}", field)))
}

impl AgentVirtualTools {
    async fn get_prompt(&self, arguments: Value) -> ToolResult {
        let server = match string_arg(&arguments, "server") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let name = match string_arg(&arguments, "name") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let Some(server_config) = self.server_configs.get(&server) else {
            return ToolResult::error(format!("no configuration for server {}", server));
        };
        let client = match self
            .session_registry
            .get_or_create(&self.session_id, &server, server_config)
            .await
        {
            Ok(client) => client,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        let prompt_args = arguments.get("arguments").and_then(Value::as_object).cloned();
        match client.get_prompt(&name, prompt_args).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn get_resource(&self, arguments: Value) -> ToolResult {
        let server = match string_arg(&arguments, "server") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let uri = match string_arg(&arguments, "uri") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let Some(server_config) = self.server_configs.get(&server) else {
            return ToolResult::error(format!("no configuration for server {}", server));
        };
        let client = match self
            .session_registry
            .get_or_create(&self.session_id, &server, server_config)
            .await
        {
            Ok(client) => client,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        match client.read_resource(&uri).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn read_large_output(&self, arguments: Value) -> ToolResult {
        let filename = match string_arg(&arguments, "filename") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let start = arguments.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;
        let end = arguments.get("end").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
        match context_manager::read_large_output(&self.offload_dir, &filename, start, end).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn search_large_output(&self, arguments: Value) -> ToolResult {
        let filename = match string_arg(&arguments, "filename") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let pattern = match string_arg(&arguments, "pattern") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let case_sensitive = arguments.get("case_sensitive").and_then(Value::as_bool).unwrap_or(false);
        let max_results = arguments.get("max_results").and_then(Value::as_u64).map(|n| n as usize);
        match context_manager::search_large_output(
            &self.offload_dir,
            &filename,
            &pattern,
            case_sensitive,
            max_results,
        )
        .await
        {
            Ok(matches) => ToolResult::ok(matches.join("\n")),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn query_large_output(&self, arguments: Value) -> ToolResult {
        let filename = match string_arg(&arguments, "filename") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let query = match string_arg(&arguments, "query") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let compact = arguments.get("compact").and_then(Value::as_bool).unwrap_or(false);
        let raw = arguments.get("raw").and_then(Value::as_bool).unwrap_or(false);
        match context_manager::query_large_output(&self.offload_dir, &filename, &query, compact, raw).await {
            Ok(result) => ToolResult::ok(result),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn search_tools(&self, arguments: Value) -> ToolResult {
        let query = match string_arg(&arguments, "query") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let needle = query.to_lowercase();
        let matches: Vec<Value> = self
            .all_tools
            .iter()
            .filter(|(name, def)| {
                name.to_lowercase().contains(&needle) || def.description.to_lowercase().contains(&needle)
            })
            .take(10)
            .map(|(name, def)| serde_json::json!({"name": name, "description": def.description}))
            .collect();
        ToolResult::ok(serde_json::to_string(&Value::Array(matches)).unwrap_or_default())
    }

    async fn add_tool(&self, arguments: Value) -> ToolResult {
        let name = match string_arg(&arguments, "name") {
            Ok(s) => s,
            Err(e) => return e,
        };
        if !self.all_tools.iter().any(|(tool_name, _)| tool_name == &name) {
            return ToolResult::error(format!("no such tool: {}", name));
        }
        self.active_tools.lock().await.insert(name.clone());
        ToolResult::ok(format!("{} added to the active toolset", name))
    }

    async fn discover_code_files(&self) -> ToolResult {
        if self.mode != PromptMode::CodeExecution {
            return ToolResult::error("discover_code_files is only available in code-execution mode");
        }
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.generated_dir).await {
            Ok(entries) => entries,
            Err(e) => return ToolResult::error(format!("could not read generated directory: {}", e)),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                files.push(name.to_string());
            }
        }
        ToolResult::ok(serde_json::to_string(&files).unwrap_or_default())
    }

    async fn write_code(&self, arguments: Value) -> ToolResult {
        if self.mode != PromptMode::CodeExecution {
            return ToolResult::error("write_code is only available in code-execution mode");
        }
        let filename = match string_arg(&arguments, "filename") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let content = match string_arg(&arguments, "content") {
            Ok(s) => s,
            Err(e) => return e,
        };
        let sanitized = artifact_generator::sanitize_segment(&filename);
        if sanitized.is_empty() {
            return ToolResult::error("filename sanitizes to an empty name");
        }
        let dir = self.generated_dir.join("user_code");
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return ToolResult::error(format!("could not create user_code directory: {}", e));
        }
        let path = dir.join(format!("{}.rs", sanitized));
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::ok(format!("wrote {}", path.display())),
            Err(e) => ToolResult::error(format!("could not write {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn candidate(server: &str, name: &str, ownership: Ownership) -> CandidateTool {
        CandidateTool {
            server_name: server.to_string(),
            tool: CachedTool {
                name: name.to_string(),
                description: format!("{} on {}", name, server),
                input_schema: serde_json::json!({"type": "object"}),
                ownership,
            },
        }
    }

    #[test]
    fn selection_filters_pass_everything_when_unset() {
        let candidates = vec![candidate("a", "tool1", Ownership::Primary)];
        let config = AgentConfig::default();
        let filtered = apply_selection_filters(candidates, &config);
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn selection_filters_keep_only_selected_server() {
        let candidates = vec![
            candidate("a", "tool1", Ownership::Primary),
            candidate("b", "tool2", Ownership::Primary),
        ];
        let mut config = AgentConfig::default();
        config.selected_servers = vec!["a".to_string()];
        let filtered = apply_selection_filters(candidates, &config);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].server_name, "a");
    }

    #[test]
    fn explicit_tool_selection_overrides_server_selection() {
        let candidates = vec![
            candidate("a", "tool1", Ownership::Primary),
            candidate("a", "tool2", Ownership::Primary),
        ];
        let mut config = AgentConfig::default();
        config.selected_servers = vec!["a".to_string()];
        config.selected_tools = vec!["a:tool1".to_string()];
        let filtered = apply_selection_filters(candidates, &config);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].tool.name, "tool1");
    }

    #[test]
    fn ownership_resolution_keeps_only_primary() {
        let candidates = vec![
            candidate("a", "shared", Ownership::Primary),
            candidate("b", "shared", Ownership::Duplicate),
        ];
        let effective = resolve_ownership(candidates);
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].server_name, "a");
    }

    #[test]
    fn ownership_resolution_drops_group_with_no_primary_present() {
        let candidates = vec![candidate("b", "shared", Ownership::Duplicate)];
        let effective = resolve_ownership(candidates);
        assert!(effective.is_empty());
    }

    #[test]
    fn virtual_tool_definitions_for_code_execution_mode_omit_discovery_tools() {
        let defs = virtual_tool_definitions(PromptMode::CodeExecution, true, true, true);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"discover_code_files"));
        assert!(names.contains(&"write_code"));
        assert!(!names.contains(&"get_prompt"));
        assert!(!names.contains(&"query_large_output"));
    }

    #[test]
    fn virtual_tool_definitions_for_tool_search_mode_include_search_and_add() {
        let defs = virtual_tool_definitions(PromptMode::ToolSearch, false, false, false);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"search_tools"));
        assert!(names.contains(&"add_tool"));
    }

    #[test]
    fn virtual_tool_definitions_include_offload_tools_only_when_enabled() {
        let defs = virtual_tool_definitions(PromptMode::DirectTool, false, false, true);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"read_large_output"));
        assert!(names.contains(&"search_large_output"));
        assert!(names.contains(&"query_large_output"));

        let defs_disabled = virtual_tool_definitions(PromptMode::DirectTool, false, false, false);
        assert!(defs_disabled.is_empty());
    }

    #[test]
    fn string_arg_reports_missing_field() {
        let args = serde_json::json!({});
        let result = string_arg(&args, "name");
        assert!(result.is_err());
    }
}
