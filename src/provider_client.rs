//! Provider Client (C2): the live binding to one already-connected MCP server.
//!
//! A [`ProviderClient`] wraps an `rmcp` session plus the retry/backoff policy used to establish
//! it and the per-tool timeout applied to every `CallTool`. Resource discovery (`list_resources`/
//! `read_resource`) is folded in here as two more forwarded MCP operations rather than living in
//! a separate resource protocol module.

use std::time::Duration;

use rmcp::model::{CallToolRequestParam, Implementation};
use serde_json::{Map, Value};

use crate::config::ServerConfig;
use crate::error::{ProviderClientError, TransportError};
use crate::transport::{self, McpSession};

/// Exponential backoff parameters for [`ProviderClient::connect_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Per-attempt ceiling on a single connect call, accommodating slow package launchers (`npx`,
/// `uvx`, ...) that may need to resolve and download a package before a server ever speaks MCP.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// A single tool description as advertised by `ListTools`.
#[derive(Debug, Clone)]
pub struct McpToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A live client for one MCP server.
pub struct ProviderClient {
    server_name: String,
    session: McpSession,
    call_timeout: Duration,
}

impl ProviderClient {
    /// Connect to `server` with retry, applying exponential backoff between attempts.
    ///
    /// On the final failed attempt the error is returned as-is; callers at the session/agent
    /// layer are expected to log a structured warning and proceed without this server's tools
    /// rather than failing the whole fleet (§7).
    pub async fn connect_with_retry(
        server_name: &str,
        server: &ServerConfig,
        client_impl: &Implementation,
        policy: BackoffPolicy,
        call_timeout: Duration,
    ) -> Result<Self, ProviderClientError> {
        let mut delay = policy.initial_delay;
        let mut attempt = 0;
        loop {
            let progress_name = server_name.to_string();
            let progress_task = tokio::spawn(async move {
                let mut elapsed = Duration::ZERO;
                loop {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    elapsed += Duration::from_secs(30);
                    log::warn!(
                        "provider_client: still connecting to {} after {:?}",
                        progress_name,
                        elapsed
                    );
                }
            });

            let attempt_result =
                match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, transport::connect(server, client_impl))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Connect(format!(
                        "connect attempt exceeded {:?}",
                        CONNECT_ATTEMPT_TIMEOUT
                    ))),
                };
            progress_task.abort();

            match attempt_result {
                Ok(session) => {
                    return Ok(Self {
                        server_name: server_name.to_string(),
                        session,
                        call_timeout,
                    });
                }
                Err(TransportError::FatalStderr(line)) => {
                    // Short-circuits retry: a fatal stderr marker means the process will never
                    // come up no matter how many times we retry it.
                    return Err(ProviderClientError::Transport(TransportError::FatalStderr(
                        line,
                    )));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > policy.max_retries {
                        return Err(ProviderClientError::Transport(e));
                    }
                    log::warn!(
                        "provider_client: connect attempt {} for {} failed: {}; retrying in {:?}",
                        attempt,
                        server_name,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64((delay.as_secs_f64() * policy.factor).min(
                        policy.max_delay.as_secs_f64(),
                    ));
                }
            }
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// List every tool this server advertises.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDescriptor>, ProviderClientError> {
        let result = tokio::time::timeout(Duration::from_secs(5 * 60), self.session.list_tools(Default::default()))
            .await
            .map_err(|_| ProviderClientError::Timeout("list_tools".to_string()))?
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))?;

        Ok(result
            .tools
            .into_iter()
            .map(|t| McpToolDescriptor {
                name: t.name.into_owned(),
                description: t.description.map(|d| d.into_owned()).unwrap_or_default(),
                input_schema: Value::Object(t.input_schema.as_ref().clone()),
            })
            .collect())
    }

    /// Invoke `tool_name` with `arguments`, applying the configured per-tool timeout.
    ///
    /// Serializes the result to a string for the Controller to fold into history; the MCP
    /// `isError` flag (when present) is surfaced as [`ProviderClientError::ToolCallFailed`] with
    /// the `Tool call failed with error: …` prefix the Controller expects (§7).
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<String, ProviderClientError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Some(map)
            }
        };

        let call = self.session.call_tool(CallToolRequestParam {
            name: tool_name.to_string().into(),
            arguments,
        });

        let result = tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| ProviderClientError::Timeout(format!("call_tool({})", tool_name)))?
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))?;

        if result.is_error.unwrap_or(false) {
            return Err(ProviderClientError::ToolCallFailed(
                serde_json::to_string(&result.content).unwrap_or_default(),
            ));
        }

        serde_json::to_string(&result.content)
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))
    }

    /// List resources exposed by this server.
    pub async fn list_resources(&self) -> Result<Vec<Value>, ProviderClientError> {
        let result = self
            .session
            .list_resources(Default::default())
            .await
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))?;
        Ok(result
            .resources
            .into_iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect())
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<String, ProviderClientError> {
        let result = self
            .session
            .read_resource(rmcp::model::ReadResourceRequestParam { uri: uri.to_string().into() })
            .await
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))?;
        serde_json::to_string(&result.contents)
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))
    }

    /// List the named prompt templates this server advertises.
    pub async fn list_prompts(&self) -> Result<Vec<String>, ProviderClientError> {
        let result = self
            .session
            .list_prompts(Default::default())
            .await
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))?;
        Ok(result.prompts.into_iter().map(|p| p.name).collect())
    }

    /// Retrieve a named prompt, filled in with `arguments`.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<String, ProviderClientError> {
        let result = self
            .session
            .get_prompt(rmcp::model::GetPromptRequestParam {
                name: name.to_string(),
                arguments,
            })
            .await
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))?;
        serde_json::to_string(&result.messages)
            .map_err(|e| ProviderClientError::ToolCallFailed(e.to_string()))
    }

    /// Tear down the underlying session.
    pub async fn close(self) -> Result<(), ProviderClientError> {
        self.session
            .cancel()
            .await
            .map_err(|e| ProviderClientError::Unhealthy(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_policy_default_matches_spec() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.factor, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_retries, 3);
    }
}
