//! Crate-wide error types.
//!
//! Each module that can fail defines its own small error enum implementing
//! `std::fmt::Display` + `std::error::Error`. [`RuntimeError`] composes all of them behind
//! `From` conversions so callers that cross module boundaries (e.g. the Conversation Controller
//! calling into the Provider Client and the Context Manager) can propagate with a plain `?`.

use std::fmt;

/// Errors raised while constructing or driving a transport (stdio/SSE/HTTP) to an MCP server.
#[derive(Debug)]
pub enum TransportError {
    /// The configured stdio command was not found on `PATH`.
    CommandNotFound(String),
    /// The subprocess wrote a recognized fatal marker to stderr before completing initialization.
    FatalStderr(String),
    /// The underlying `rmcp` transport failed to connect or initialize.
    Connect(String),
    /// An operation exceeded its configured timeout.
    Timeout(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::CommandNotFound(cmd) => {
                write!(f, "command not found on PATH: {}", cmd)
            }
            TransportError::FatalStderr(line) => write!(f, "fatal stderr output: {}", line),
            TransportError::Connect(msg) => write!(f, "transport connect failed: {}", msg),
            TransportError::Timeout(op) => write!(f, "transport operation timed out: {}", op),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors raised while a [`ProviderClient`](crate::provider_client::ProviderClient) talks to an
/// already-connected MCP server.
#[derive(Debug)]
pub enum ProviderClientError {
    /// Transport-level failure (connect, retry exhaustion, fatal stderr).
    Transport(TransportError),
    /// The server returned an explicit tool-call error.
    ToolCallFailed(String),
    /// `CallTool`/`ListTools` exceeded its configured per-attempt timeout.
    Timeout(String),
    /// The client was observed unhealthy (e.g. broken pipe) and must be recreated.
    Unhealthy(String),
}

impl fmt::Display for ProviderClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderClientError::Transport(e) => write!(f, "{}", e),
            ProviderClientError::ToolCallFailed(msg) => {
                write!(f, "Tool call failed with error: {}", msg)
            }
            ProviderClientError::Timeout(op) => write!(f, "provider client timed out: {}", op),
            ProviderClientError::Unhealthy(reason) => {
                write!(f, "provider client unhealthy: {}", reason)
            }
        }
    }
}

impl std::error::Error for ProviderClientError {}

impl From<TransportError> for ProviderClientError {
    fn from(e: TransportError) -> Self {
        ProviderClientError::Transport(e)
    }
}

/// Errors raised by the Tool Catalog Cache.
#[derive(Debug)]
pub enum CatalogError {
    /// Failure reading or writing the on-disk cache entry.
    Io(String),
    /// Failure (de)serialising a cache entry.
    Serde(String),
    /// No cache entry and no live discovery source for the requested key.
    NotFound(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(msg) => write!(f, "catalog I/O error: {}", msg),
            CatalogError::Serde(msg) => write!(f, "catalog serialization error: {}", msg),
            CatalogError::NotFound(key) => write!(f, "no catalog entry for key: {}", key),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Errors raised while building a Conversation Controller turn.
#[derive(Debug)]
pub enum ControllerError {
    /// The underlying [`ClientWrapper`](crate::client_wrapper::ClientWrapper) call failed.
    Llm(String),
    /// A dispatched tool call could not be resolved to any known origin.
    UnknownTool(String),
    /// Forced summarization at `maxTurns` failed; the Controller surfaces this and returns
    /// whatever content is available.
    SummarizationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Llm(msg) => write!(f, "LLM call failed: {}", msg),
            ControllerError::UnknownTool(name) => write!(f, "unknown tool origin: {}", name),
            ControllerError::SummarizationFailed(msg) => {
                write!(f, "forced summarization failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ControllerError {}

/// Errors raised by the Context Manager (offloading and summarization).
#[derive(Debug)]
pub enum ContextError {
    /// Failure writing an offload file to disk.
    OffloadIo(String),
    /// `query_large_output` was called against a `.txt` offload file, which is never
    /// best-effort-parsed as JSON.
    NotJson(String),
    /// The requested offload file does not exist.
    FileNotFound(String),
    /// The jq-lite query string could not be parsed.
    BadQuery(String),
    /// `search_large_output`'s pattern is not a valid regex.
    BadPattern(String),
    /// Summarization's LLM call failed; the original history is left untouched.
    SummarizationFailed(String),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::OffloadIo(msg) => write!(f, "offload I/O error: {}", msg),
            ContextError::NotJson(filename) => {
                write!(f, "{} is not a JSON offload file", filename)
            }
            ContextError::FileNotFound(filename) => {
                write!(f, "offload file not found: {}", filename)
            }
            ContextError::BadQuery(query) => write!(f, "invalid query: {}", query),
            ContextError::BadPattern(pattern) => write!(f, "invalid search pattern: {}", pattern),
            ContextError::SummarizationFailed(msg) => {
                write!(f, "summarization failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ContextError {}

/// Errors raised by the Custom Tool Registry.
#[derive(Debug)]
pub enum ToolError {
    /// No tool is registered under the requested name.
    NotFound(String),
    /// A tool execution binding returned an error.
    ExecutionFailed(String),
    /// Registration was rejected (empty category, name collides with a virtual tool).
    InvalidRegistration(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
            ToolError::InvalidRegistration(msg) => write!(f, "invalid tool registration: {}", msg),
        }
    }
}

impl std::error::Error for ToolError {}

/// Errors raised by the Streaming Gateway.
#[derive(Debug)]
pub enum GatewayError {
    /// The WebSocket upgrade or handshake failed.
    Upgrade(String),
    /// A `ToolResult` referenced a `callID` with no awaiting dispatch.
    UnmatchedCallId(String),
    /// The agent referenced by the request does not exist.
    UnknownAgent(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Upgrade(msg) => write!(f, "gateway upgrade failed: {}", msg),
            GatewayError::UnmatchedCallId(id) => {
                write!(f, "no dispatch awaiting call id: {}", id)
            }
            GatewayError::UnknownAgent(id) => write!(f, "unknown agent id: {}", id),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Errors raised while loading or merging the MCP configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(String),
    /// The configuration file was not valid JSON, or failed schema validation.
    Parse(String),
    /// The named server was not present in the merged configuration.
    ServerNotFound(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::ServerNotFound(name) => write!(f, "server not found in config: {}", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level error composing every module-level error behind a single `Box<dyn Error>`-free
/// boundary, following the donor crate's `ToolError`/`ResourceError` manual `Display`+`Error`
/// pattern rather than `thiserror`/`anyhow`.
#[derive(Debug)]
pub enum RuntimeError {
    Transport(TransportError),
    ProviderClient(ProviderClientError),
    Catalog(CatalogError),
    Controller(ControllerError),
    Context(ContextError),
    Tool(ToolError),
    Gateway(GatewayError),
    Config(ConfigError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Transport(e) => write!(f, "{}", e),
            RuntimeError::ProviderClient(e) => write!(f, "{}", e),
            RuntimeError::Catalog(e) => write!(f, "{}", e),
            RuntimeError::Controller(e) => write!(f, "{}", e),
            RuntimeError::Context(e) => write!(f, "{}", e),
            RuntimeError::Tool(e) => write!(f, "{}", e),
            RuntimeError::Gateway(e) => write!(f, "{}", e),
            RuntimeError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<TransportError> for RuntimeError {
    fn from(e: TransportError) -> Self {
        RuntimeError::Transport(e)
    }
}

impl From<ProviderClientError> for RuntimeError {
    fn from(e: ProviderClientError) -> Self {
        RuntimeError::ProviderClient(e)
    }
}

impl From<CatalogError> for RuntimeError {
    fn from(e: CatalogError) -> Self {
        RuntimeError::Catalog(e)
    }
}

impl From<ControllerError> for RuntimeError {
    fn from(e: ControllerError) -> Self {
        RuntimeError::Controller(e)
    }
}

impl From<ContextError> for RuntimeError {
    fn from(e: ContextError) -> Self {
        RuntimeError::Context(e)
    }
}

impl From<ToolError> for RuntimeError {
    fn from(e: ToolError) -> Self {
        RuntimeError::Tool(e)
    }
}

impl From<GatewayError> for RuntimeError {
    fn from(e: GatewayError) -> Self {
        RuntimeError::Gateway(e)
    }
}

impl From<ConfigError> for RuntimeError {
    fn from(e: ConfigError) -> Self {
        RuntimeError::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_failed_message_matches_controller_prefix() {
        let err = ProviderClientError::ToolCallFailed("boom".to_string());
        assert_eq!(err.to_string(), "Tool call failed with error: boom");
    }

    #[test]
    fn runtime_error_from_conversions_preserve_display() {
        let err: RuntimeError = ContextError::NotJson("tool_x.txt".to_string()).into();
        assert_eq!(err.to_string(), "tool_x.txt is not a JSON offload file");
    }
}
