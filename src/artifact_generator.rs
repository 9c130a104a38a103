//! Artifact Generator (C5): emits OpenAPI documents and native function stubs from cached tool
//! schemas, for code-execution mode.
//!
//! Generation only runs when [`crate::catalog::Catalog::codegen_enabled`] is set; the default
//! agent mode (direct tool calling, no code execution) never touches disk here. Path segments
//! and schema names are sanitized to lowercase `snake_case` so output is byte-reproducible across
//! runs, and object properties are emitted in sorted order for the same reason.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::custom_tools::ToolMetadata;
use crate::error::CatalogError;
use crate::schema_normalizer;

/// Lowercase, snake_case a path segment or schema name: non-alphanumeric runs collapse to a
/// single underscore, and the result is trimmed of leading/trailing underscores.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Recursively sort an object's keys so two semantically identical schemas serialize to the same
/// bytes.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// One tool that's about to become an OpenAPI operation, independent of whether it came from an
/// MCP server or the custom tool registry.
pub struct ArtifactTool<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub input_schema: &'a Value,
}

const RESPONSE_ENVELOPE_SCHEMA_NAME: &str = "tool_response";

fn response_envelope_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "success": {"type": "boolean"},
            "result": {"type": "string"},
            "error": {"type": "string"},
        },
        "required": ["success"],
    })
}

/// Build an OpenAPI 3.0.3 document for one server's tools plus, optionally, a set of custom
/// tools grouped by category under `POST /tools/custom/<tool>`.
pub fn generate_openapi_document(
    server_name: &str,
    tools: &[ArtifactTool<'_>],
    custom_tools: &[&ToolMetadata],
) -> Value {
    let server_segment = sanitize_segment(server_name);
    let mut paths = Map::new();

    for tool in tools {
        let tool_segment = sanitize_segment(tool.name);
        let path = format!("/tools/mcp/{}/{}", server_segment, tool_segment);
        let (normalized_schema, _) = schema_normalizer::normalize(tool.input_schema);
        paths.insert(
            path,
            build_operation(tool.name, tool.description, &normalized_schema),
        );
    }

    for tool in custom_tools {
        let tool_segment = sanitize_segment(&tool.name);
        let path = format!("/tools/custom/{}", tool_segment);
        let (normalized_schema, _) = schema_normalizer::normalize(&tool.parameters_schema());
        paths.insert(
            path,
            build_operation(&tool.name, &tool.description, &normalized_schema),
        );
    }

    let doc = serde_json::json!({
        "openapi": "3.0.3",
        "info": {
            "title": format!("{} tools", server_segment),
            "version": "1.0.0",
        },
        "paths": paths,
        "components": {
            "schemas": {
                RESPONSE_ENVELOPE_SCHEMA_NAME: response_envelope_schema(),
            },
            "securitySchemes": {
                "bearerAuth": {
                    "type": "http",
                    "scheme": "bearer",
                }
            }
        },
        "security": [{"bearerAuth": []}],
    });

    sort_keys(&doc)
}

fn build_operation(name: &str, description: &str, request_schema: &Value) -> Value {
    serde_json::json!({
        "post": {
            "operationId": sanitize_segment(name),
            "summary": description,
            "requestBody": {
                "required": true,
                "content": {
                    "application/json": {"schema": request_schema}
                }
            },
            "responses": {
                "200": {
                    "description": "Tool call result",
                    "content": {
                        "application/json": {
                            "schema": {"$ref": format!("#/components/schemas/{}", RESPONSE_ENVELOPE_SCHEMA_NAME)}
                        }
                    }
                }
            }
        }
    })
}

/// Render a native (Rust) function stub that calls a server's tool over HTTP. The stub retries
/// once after a 100 ms delay on a broken-pipe style failure, detected by substring match across
/// the error, the response content, and the raw HTTP body — mirroring how flaky local MCP bridge
/// processes actually fail.
pub fn generate_native_stub(server_name: &str, tool_name: &str, base_url: &str) -> String {
    let server_segment = sanitize_segment(server_name);
    let tool_segment = sanitize_segment(tool_name);
    let path = format!("/tools/mcp/{}/{}", server_segment, tool_segment);

    format!(
        r#"// Generated stub for {server}/{tool}. Do not hand-edit; regenerate via the Artifact Generator.
pub async fn {tool_segment}(
    client: &reqwest::Client,
    arguments: serde_json::Value,
) -> Result<String, Box<dyn std::error::Error>> {{
    let url = format!("{{}}{path}", "{base_url}");
    match call_once(client, &url, &arguments).await {{
        Ok(body) => Ok(body),
        Err(e) if is_broken_pipe(&e.to_string()) => {{
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            call_once(client, &url, &arguments).await
        }}
        Err(e) => Err(e),
    }}
}}

async fn call_once(
    client: &reqwest::Client,
    url: &str,
    arguments: &serde_json::Value,
) -> Result<String, Box<dyn std::error::Error>> {{
    let response = client.post(url).json(arguments).send().await?;
    let body = response.text().await?;
    if is_broken_pipe(&body) {{
        return Err(format!("broken pipe in response body: {{}}", body).into());
    }}
    Ok(body)
}}

fn is_broken_pipe(haystack: &str) -> bool {{
    haystack.contains("broken pipe") || haystack.contains("connection reset")
}}
"#,
        server = server_name,
        tool = tool_name,
        tool_segment = tool_segment,
        path = path,
        base_url = base_url,
    )
}

/// Write an OpenAPI document and one native stub per tool under
/// `<generated_dir>/<server>_tools/`, plus an index file listing every emitted stub. No-op if
/// `codegen_enabled` is false.
pub async fn write_artifacts_for_server(
    generated_dir: &Path,
    server_name: &str,
    tools: &[ArtifactTool<'_>],
    custom_tools: &[&ToolMetadata],
    base_url: &str,
    codegen_enabled: bool,
) -> Result<Option<PathBuf>, CatalogError> {
    if !codegen_enabled {
        return Ok(None);
    }

    let server_segment = sanitize_segment(server_name);
    let package_dir = generated_dir.join(format!("{}_tools", server_segment));
    tokio::fs::create_dir_all(&package_dir)
        .await
        .map_err(|e| CatalogError::Io(e.to_string()))?;

    let doc = generate_openapi_document(server_name, tools, custom_tools);
    let doc_path = package_dir.join("openapi.json");
    tokio::fs::write(
        &doc_path,
        serde_json::to_string_pretty(&doc).map_err(|e| CatalogError::Serde(e.to_string()))?,
    )
    .await
    .map_err(|e| CatalogError::Io(e.to_string()))?;

    let mut index = String::new();
    for tool in tools {
        let stub = generate_native_stub(server_name, tool.name, base_url);
        let tool_segment = sanitize_segment(tool.name);
        let stub_path = package_dir.join(format!("{}.rs", tool_segment));
        tokio::fs::write(&stub_path, stub)
            .await
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        index.push_str(&format!("pub mod {};\n", tool_segment));
    }
    tokio::fs::write(package_dir.join("mod.rs"), index)
        .await
        .map_err(|e| CatalogError::Io(e.to_string()))?;

    Ok(Some(package_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_segment_lowercases_and_collapses_separators() {
        assert_eq!(sanitize_segment("Search Emails!!"), "search_emails");
        assert_eq!(sanitize_segment("gmail-mcp-server"), "gmail_mcp_server");
    }

    #[test]
    fn openapi_document_is_byte_stable_across_calls() {
        let schema = serde_json::json!({"type": "object", "properties": {"b": {"type": "string"}, "a": {"type": "number"}}});
        let tool = ArtifactTool {
            name: "search_emails",
            description: "Search emails",
            input_schema: &schema,
        };
        let first = generate_openapi_document("gmail", &[tool], &[]);
        let tool2 = ArtifactTool {
            name: "search_emails",
            description: "Search emails",
            input_schema: &schema,
        };
        let second = generate_openapi_document("gmail", &[tool2], &[]);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn operation_path_uses_sanitized_segments() {
        let schema = serde_json::json!({"type": "object"});
        let tool = ArtifactTool {
            name: "Search Emails",
            description: "",
            input_schema: &schema,
        };
        let doc = generate_openapi_document("Gmail Server", &[tool], &[]);
        let paths = doc["paths"].as_object().unwrap();
        assert!(paths.contains_key("/tools/mcp/gmail_server/search_emails"));
    }

    #[test]
    fn native_stub_detects_broken_pipe_substring() {
        let stub = generate_native_stub("gmail", "search_emails", "http://localhost:8080");
        assert!(stub.contains("is_broken_pipe"));
        assert!(stub.contains("100"));
    }

    #[tokio::test]
    async fn write_artifacts_is_noop_when_codegen_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_artifacts_for_server(
            dir.path(),
            "gmail",
            &[],
            &[],
            "http://localhost:8080",
            false,
        )
        .await
        .unwrap();
        assert!(result.is_none());
        assert!(!dir.path().join("gmail_tools").exists());
    }
}
