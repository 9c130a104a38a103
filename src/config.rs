//! MCP server configuration loading and agent-level configuration.
//!
//! The on-disk configuration format is a single JSON document:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "gmail": { "command": "npx", "args": ["-y", "gmail-mcp-server"] },
//!     "weather": { "url": "https://example.com/mcp/sse" }
//!   }
//! }
//! ```
//!
//! [`load_and_merge`] overlays an optional `<path>_user.json` sibling on top of the primary file
//! so a user can add or override individual servers without editing the shared configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Transport protocol for an MCP server, either stated explicitly or inferred from the
/// configuration shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Stdio,
    Sse,
    Http,
}

/// Optional OAuth settings for SSE/HTTP servers that require bearer-token refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<String>,
    pub scopes: Option<Vec<String>>,
}

/// Connection-pool tuning knobs forwarded to the Session Registry when creating a client for
/// this server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_idle: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
}

/// A single `mcpServers` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stdio transport: the executable to spawn.
    pub command: Option<String>,
    /// Stdio transport: arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// SSE/HTTP transport: the server URL.
    pub url: Option<String>,
    /// SSE/HTTP transport: extra headers to attach to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Environment variables to set on the spawned stdio subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Explicit protocol override; when absent the protocol is inferred (see
    /// [`ServerConfig::resolved_protocol`]).
    pub protocol: Option<Protocol>,
    pub pool_config: Option<PoolConfig>,
    pub oauth: Option<OAuthConfig>,
}

impl ServerConfig {
    /// Resolve the transport protocol: an explicit `protocol` field always wins; otherwise a URL
    /// containing `/sse` selects SSE, any other `http(s)://` URL selects HTTP, and the absence of
    /// a URL selects stdio.
    pub fn resolved_protocol(&self) -> Protocol {
        if let Some(p) = self.protocol {
            return p;
        }
        match &self.url {
            Some(url) if url.contains("/sse") => Protocol::Sse,
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Protocol::Http
            }
            _ => Protocol::Stdio,
        }
    }
}

/// Top-level shape of an MCP configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, ServerConfig>,
}

/// Load the primary configuration file at `path`, then overlay `<path>_user.json` if it exists.
/// Overlay entries replace base entries with the same server name; servers present only in the
/// overlay are added.
pub fn load_and_merge(path: impl AsRef<Path>) -> Result<McpServersFile, ConfigError> {
    let path = path.as_ref();
    let mut merged = load_file(path)?;

    let overlay_path = user_overlay_path(path);
    if overlay_path.exists() {
        let overlay = load_file(&overlay_path)?;
        for (name, server) in overlay.mcp_servers {
            merged.mcp_servers.insert(name, server);
        }
    }

    Ok(merged)
}

fn user_overlay_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("config");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    path.with_file_name(format!("{}_user.{}", stem, ext))
}

fn load_file(path: &Path) -> Result<McpServersFile, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
}

/// Per-construction Agent configuration (§6 "Agent configuration").
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub provider: String,
    pub model_id: String,
    pub temperature: f32,
    pub max_turns: usize,
    pub selected_servers: Vec<String>,
    pub selected_tools: Vec<String>,
    pub system_prompt_override: Option<String>,
    pub enable_context_summarization: bool,
    pub enable_context_offloading: bool,
    pub enable_streaming: bool,
    /// Whether a forced summarization + one final LLM call is attempted when `max_turns` is
    /// reached, per the resolved open question in `DESIGN.md`.
    pub force_finalize_on_max_turns: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model_id: "gpt-4.1-nano".to_string(),
            temperature: 0.7,
            max_turns: 25,
            selected_servers: Vec::new(),
            selected_tools: Vec::new(),
            system_prompt_override: None,
            enable_context_summarization: true,
            enable_context_offloading: true,
            enable_streaming: false,
            force_finalize_on_max_turns: true,
        }
    }
}

/// Environment variables consulted by the runtime (§6).
pub struct EnvConfig {
    pub cache_dir: PathBuf,
    pub cache_ttl_minutes: u64,
    pub generated_dir: PathBuf,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub session_id: Option<String>,
}

impl EnvConfig {
    /// Read all five environment variables, applying the documented defaults where unset.
    pub fn from_env() -> Self {
        Self {
            cache_dir: std::env::var("MCP_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".mcp_cache")),
            cache_ttl_minutes: std::env::var("MCP_CACHE_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7 * 24 * 60),
            generated_dir: std::env::var("MCP_GENERATED_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".mcp_generated")),
            api_url: std::env::var("MCP_API_URL").ok(),
            api_token: std::env::var("MCP_API_TOKEN").ok(),
            session_id: std::env::var("MCP_SESSION_ID").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_inferred_from_sse_url() {
        let server = ServerConfig {
            url: Some("https://example.com/mcp/sse".to_string()),
            ..Default::default()
        };
        assert_eq!(server.resolved_protocol(), Protocol::Sse);
    }

    #[test]
    fn protocol_inferred_from_http_url() {
        let server = ServerConfig {
            url: Some("https://example.com/mcp".to_string()),
            ..Default::default()
        };
        assert_eq!(server.resolved_protocol(), Protocol::Http);
    }

    #[test]
    fn protocol_defaults_to_stdio_without_url() {
        let server = ServerConfig {
            command: Some("npx".to_string()),
            ..Default::default()
        };
        assert_eq!(server.resolved_protocol(), Protocol::Stdio);
    }

    #[test]
    fn explicit_protocol_override_wins() {
        let server = ServerConfig {
            url: Some("https://example.com/mcp/sse".to_string()),
            protocol: Some(Protocol::Http),
            ..Default::default()
        };
        assert_eq!(server.resolved_protocol(), Protocol::Http);
    }

    #[test]
    fn load_and_merge_overlays_user_file() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("mcp_config.json");
        std::fs::write(
            &base_path,
            r#"{"mcpServers": {"gmail": {"command": "npx", "args": ["-y", "gmail-mcp"]}}}"#,
        )
        .unwrap();
        let user_path = dir.path().join("mcp_config_user.json");
        std::fs::write(
            &user_path,
            r#"{"mcpServers": {"weather": {"url": "https://example.com/mcp/sse"}}}"#,
        )
        .unwrap();

        let merged = load_and_merge(&base_path).unwrap();
        assert_eq!(merged.mcp_servers.len(), 2);
        assert!(merged.mcp_servers.contains_key("gmail"));
        assert!(merged.mcp_servers.contains_key("weather"));
    }
}
