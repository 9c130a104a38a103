//! Transport Drivers (C1): connect to an MCP server over stdio, SSE, or streamable HTTP.
//!
//! [`connect`] dispatches on [`ServerConfig::resolved_protocol`](crate::config::ServerConfig::resolved_protocol)
//! and returns a live `rmcp` client session. The stdio path additionally tails the subprocess's
//! stderr for a short window after spawn looking for a recognized fatal marker (a `SyntaxError`,
//! module-not-found, or similar line that means the process will never finish initializing), so
//! a broken server fails fast instead of waiting out the full initialize timeout.

use std::process::Stdio;
use std::time::Duration;

use rmcp::model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion};
use rmcp::service::{DynService, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

use crate::config::{Protocol, ServerConfig};
use crate::error::TransportError;

/// A connected MCP client session, generic over transport.
pub type McpSession = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

/// How long to watch a freshly spawned stdio subprocess's stderr for a fatal marker before
/// proceeding with the normal `rmcp` handshake. Keeping this short means a healthy server's
/// startup latency is unaffected; an unhealthy one is reported well inside the 10 minute
/// `Initialize` timeout (§5).
const FATAL_STDERR_WATCH: Duration = Duration::from_millis(200);

/// Case-insensitive substrings that mark a stdio server's stderr output as unrecoverable on
/// their own.
const FATAL_STDERR_MARKERS: &[&str] = &[
    "syntaxerror",
    "cannot find module",
    "modulenotfounderror",
    "traceback (most recent call last)",
    "engine \"node\"",
    "process exited",
    "exited with code",
];

/// Substrings that only mean a fatal condition when co-occurring with `"error:"` on the same
/// line, since they're too generic (`"not found"`, `"failed"`, ...) to treat as fatal alone.
const FATAL_STDERR_COOCCURRENCE_MARKERS: &[&str] = &[
    "cannot",
    "failed",
    "unable",
    "not found",
    "permission denied",
];

/// Whether `line` matches a recognized unrecoverable stdio-server stderr pattern.
fn is_fatal_stderr_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    if FATAL_STDERR_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    lowered.contains("error:")
        && FATAL_STDERR_COOCCURRENCE_MARKERS
            .iter()
            .any(|m| lowered.contains(m))
}

/// Connect to `server` using its resolved protocol and return a live session.
///
/// Timeouts are the caller's responsibility to layer on top (§5 distinguishes per-attempt,
/// per-operation, and per-request timeouts); this function performs a single connection
/// attempt with no internal retry — see [`crate::provider_client::ProviderClient::connect_with_retry`]
/// for the retrying wrapper.
pub async fn connect(
    server: &ServerConfig,
    client_impl: &Implementation,
) -> Result<McpSession, TransportError> {
    let client_info = ClientInfo {
        protocol_version: ProtocolVersion::default(),
        capabilities: ClientCapabilities::default(),
        client_info: client_impl.clone(),
    };

    match server.resolved_protocol() {
        Protocol::Sse => {
            let url = server
                .url
                .clone()
                .ok_or_else(|| TransportError::Connect("sse server missing url".to_string()))?;
            let transport = if server.headers.is_empty() {
                SseClientTransport::start(url.as_str())
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?
            } else {
                let http_client = http_client_with_headers(&server.headers)?;
                SseClientTransport::start_with_client(
                    http_client,
                    SseClientConfig {
                        sse_endpoint: url.into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?
            };
            client_info
                .into_dyn()
                .serve(transport)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))
        }
        Protocol::Http => {
            let url = server
                .url
                .clone()
                .ok_or_else(|| TransportError::Connect("http server missing url".to_string()))?;
            let transport = if server.headers.is_empty() {
                StreamableHttpClientTransport::from_uri(url)
            } else {
                let http_client = http_client_with_headers(&server.headers)?;
                StreamableHttpClientTransport::with_client(
                    http_client,
                    StreamableHttpClientTransportConfig {
                        uri: url.into(),
                        ..Default::default()
                    },
                )
            };
            client_info
                .into_dyn()
                .serve(transport)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))
        }
        Protocol::Stdio => connect_stdio(server, client_info).await,
    }
}

fn http_client_with_headers(
    headers: &std::collections::HashMap<String, String>,
) -> Result<reqwest::Client, TransportError> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (k, v) in headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| TransportError::Connect(format!("bad header name {}: {}", k, e)))?;
        let value = reqwest::header::HeaderValue::from_str(v)
            .map_err(|e| TransportError::Connect(format!("bad header value for {}: {}", k, e)))?;
        header_map.insert(name, value);
    }
    reqwest::ClientBuilder::new()
        .default_headers(header_map)
        .build()
        .map_err(|e| TransportError::Connect(e.to_string()))
}

async fn connect_stdio(
    server: &ServerConfig,
    client_info: ClientInfo,
) -> Result<McpSession, TransportError> {
    let command = server
        .command
        .clone()
        .ok_or_else(|| TransportError::Connect("stdio server missing command".to_string()))?;

    if which::which(&command).is_err() && !std::path::Path::new(&command).exists() {
        return Err(TransportError::CommandNotFound(command));
    }

    let mut cmd = tokio::process::Command::new(&command);
    cmd.args(&server.args)
        .envs(&server.env)
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .stdin(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| TransportError::Connect(format!("failed to spawn {}: {}", command, e)))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::Connect("child stderr not piped".to_string()))?;

    let (fatal_tx, fatal_rx) = oneshot::channel::<String>();
    tokio::spawn(tail_stderr_for_fatal_marker(stderr, fatal_tx));

    tokio::select! {
        fatal = fatal_rx => {
            if let Ok(line) = fatal {
                let _ = child.kill().await;
                return Err(TransportError::FatalStderr(line));
            }
        }
        _ = tokio::time::sleep(FATAL_STDERR_WATCH) => {}
    }

    let transport = TokioChildProcess::from_child(child)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    client_info
        .into_dyn()
        .serve(transport)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))
}

async fn tail_stderr_for_fatal_marker(
    stderr: tokio::process::ChildStderr,
    fatal_tx: oneshot::Sender<String>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_fatal_stderr_line(&line) {
            let _ = fatal_tx.send(line);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_marker_detection_matches_known_lines() {
        assert!(is_fatal_stderr_line("SyntaxError: Unexpected token '<'"));
        assert!(is_fatal_stderr_line("npm ERR! engine \"node\" is incompatible"));
        assert!(is_fatal_stderr_line("child process exited with code 1"));
    }

    #[test]
    fn fatal_marker_requires_cooccurrence_for_generic_substrings() {
        assert!(is_fatal_stderr_line("Error: cannot open config file"));
        assert!(!is_fatal_stderr_line("note: some files were not found but that's fine"));
    }

    #[test]
    fn benign_stderr_output_does_not_match() {
        assert!(!is_fatal_stderr_line("Listening on stdio transport..."));
    }
}
