//! Agent Manager (C12): process-wide lifecycle registry for built [`Agent`]s.
//!
//! `CreateAgent` builds an agent and records its cancellation handle; `DestroyAgent`/`DestroyAll`
//! cancel and drop the entry. Agents never hold a reference back to the manager (§9's
//! one-directional reference discipline), so a destroyed agent's in-flight turn observes
//! cancellation at its next suspension point without the manager needing to track it further.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rmcp::model::Implementation;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentCapabilities, AgentError};
use crate::catalog::Catalog;
use crate::client_wrapper::ClientWrapper;
use crate::config::{AgentConfig, EnvConfig};
use crate::custom_tools::CustomToolRegistry;
use crate::event::EventEmitter;
use crate::prompt_builder::PromptMode;
use crate::session_registry::SessionRegistry;

/// Everything `CreateAgent` needs to build one [`Agent`], bundled so the manager's public
/// method doesn't carry the same long argument list as [`Agent::build`].
pub struct CreateAgentRequest {
    pub mcp_config_path: PathBuf,
    pub mode: PromptMode,
    pub base_prompt: String,
    pub agent_config: AgentConfig,
    pub env_config: EnvConfig,
    pub client: Arc<dyn ClientWrapper>,
    pub client_impl: Implementation,
}

struct ManagedAgent {
    agent: Arc<Agent>,
    cancel: CancellationToken,
}

/// Process-wide `agentID → managedAgent` registry, guarded by a single read/write lock
/// (§5: never held across a blocking operation — building an agent happens before the map is
/// locked, not while holding the write guard).
pub struct AgentManager {
    agents: RwLock<HashMap<String, ManagedAgent>>,
    session_registry: Arc<SessionRegistry>,
    catalog: Arc<Catalog>,
    custom_tools: Arc<CustomToolRegistry>,
    events: Arc<EventEmitter>,
}

impl AgentManager {
    pub fn new(
        session_registry: Arc<SessionRegistry>,
        catalog: Arc<Catalog>,
        custom_tools: Arc<CustomToolRegistry>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            session_registry,
            catalog,
            custom_tools,
            events,
        }
    }

    /// Build a new agent and register it under a freshly generated id.
    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<String, AgentError> {
        let agent = Agent::build(
            request.mcp_config_path,
            request.mode,
            &request.base_prompt,
            request.agent_config,
            &request.env_config,
            request.client,
            request.client_impl,
            self.session_registry.clone(),
            self.catalog.clone(),
            self.custom_tools.clone(),
            self.events.clone(),
        )
        .await?;

        let agent_id = uuid::Uuid::new_v4().to_string();
        let managed = ManagedAgent { agent: Arc::new(agent), cancel: CancellationToken::new() };
        self.agents.write().await.insert(agent_id.clone(), managed);
        Ok(agent_id)
    }

    /// Look up a registered agent by id.
    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.get(agent_id).map(|m| m.agent.clone())
    }

    /// The cancellation handle bound to `agent_id`, for a caller (e.g. the Streaming Gateway)
    /// driving a turn that must observe the Agent Manager's own `DestroyAgent`/`DestroyAll`.
    pub async fn cancellation_for(&self, agent_id: &str) -> Option<CancellationToken> {
        self.agents.read().await.get(agent_id).map(|m| m.cancel.clone())
    }

    /// Every currently registered agent id.
    pub async fn list_agents(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// The event emitter shared by every agent this manager builds, for a Streaming Gateway
    /// connection to subscribe to.
    pub fn events(&self) -> Arc<EventEmitter> {
        self.events.clone()
    }

    /// `(tools, servers)` derived from the agent's effective toolset.
    pub async fn get_capabilities(&self, agent_id: &str) -> Option<AgentCapabilities> {
        let agent = self.get_agent(agent_id).await?;
        Some(agent.capabilities())
    }

    /// Cancel and drop one agent. Returns `false` if no such agent was registered.
    pub async fn destroy_agent(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        match agents.remove(agent_id) {
            Some(managed) => {
                managed.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and drop every registered agent.
    pub async fn destroy_all(&self) {
        let mut agents = self.agents.write().await;
        for (_, managed) in agents.drain() {
            managed.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AgentManager {
        let client_impl = Implementation { name: "agentdock-tests".to_string(), version: "0.0.0".to_string() };
        AgentManager::new(
            Arc::new(SessionRegistry::new(client_impl)),
            Arc::new(Catalog::new(std::env::temp_dir(), std::time::Duration::from_secs(60))),
            Arc::new(CustomToolRegistry::new()),
            Arc::new(EventEmitter::new()),
        )
    }

    #[tokio::test]
    async fn destroying_unknown_agent_returns_false() {
        let mgr = manager();
        assert!(!mgr.destroy_agent("nonexistent").await);
    }

    #[tokio::test]
    async fn list_agents_starts_empty() {
        let mgr = manager();
        assert!(mgr.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn destroy_all_on_empty_registry_is_a_no_op() {
        let mgr = manager();
        mgr.destroy_all().await;
        assert!(mgr.list_agents().await.is_empty());
    }
}
