//! Custom Tool Registry (C10): embedder-registered tools dispatched alongside MCP tools.
//!
//! Carries forward the `ToolResult`/`ToolMetadata`/`ToolParameter` shapes the donor crate used
//! for its own protocol-routed tools, but rebinds them to an execution-binding model: a custom
//! tool is either an in-process async function or a *stream callback* token that asks the
//! Conversation Controller to emit a `ToolCallEvent` on the Streaming Gateway and await the
//! matching result instead of calling straight through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::tools::calculator::Calculator;

/// One declared parameter of a custom tool, mirroring a JSON Schema property.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub schema: Value,
}

/// Schema and bookkeeping metadata for a registered custom tool.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    /// Organizational grouping (`data`, `workspace`, `human`, `memory`, ...) that determines the
    /// directory a generated native stub is emitted under.
    pub category: String,
}

impl ToolMetadata {
    /// Build the JSON Schema object the Prompt Builder and Artifact Generator expect, from the
    /// declared [`ToolParameter`]s.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.clone(), param.schema.clone());
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Outcome of a custom tool invocation, returned to the Conversation Controller for folding into
/// history as a `Role::Tool` message.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }
}

/// How a registered tool's invocation is actually carried out.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    async fn call(&self, arguments: Value) -> ToolResult;
}

/// Wraps a plain async closure as a [`ToolFunction`], for the common case of a tool with no
/// additional state.
pub struct FnToolFunction<F>(pub F);

#[async_trait]
impl<F, Fut> ToolFunction for FnToolFunction<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ToolResult> + Send,
{
    async fn call(&self, arguments: Value) -> ToolResult {
        (self.0)(arguments).await
    }
}

/// How a custom tool's call is actually executed once dispatched.
pub enum ExecutionBinding {
    /// Runs in-process and returns its result directly.
    Function(Arc<dyn ToolFunction>),
    /// Asks the Controller to emit a `ToolCallEvent` carrying a freshly generated call ID and
    /// await the matching `ToolResultMessage` from the Streaming Gateway instead of calling
    /// through locally.
    StreamCallback,
}

struct RegisteredTool {
    metadata: ToolMetadata,
    binding: ExecutionBinding,
}

/// Virtual tool names the runtime reserves for itself; a custom tool may not register under one
/// of these (§4.10).
pub const VIRTUAL_TOOL_NAMES: &[&str] = &[
    "get_prompt",
    "get_resource",
    "search_tools",
    "add_tool",
    "discover_code_files",
    "write_code",
    "query_large_output",
    "read_large_output",
    "search_large_output",
];

/// Registry of embedder-supplied tools, keyed by name.
#[derive(Default)]
pub struct CustomToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl CustomToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a custom tool. Rejects an empty `category` and a `name` colliding with a
    /// reserved virtual tool name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
        category: impl Into<String>,
        binding: ExecutionBinding,
    ) -> Result<(), ToolError> {
        let name = name.into();
        let category = category.into();

        if category.trim().is_empty() {
            return Err(ToolError::InvalidRegistration(format!(
                "tool {} has an empty category",
                name
            )));
        }
        if VIRTUAL_TOOL_NAMES.contains(&name.as_str()) {
            return Err(ToolError::InvalidRegistration(format!(
                "tool name {} collides with a reserved virtual tool",
                name
            )));
        }

        self.tools.insert(
            name.clone(),
            RegisteredTool {
                metadata: ToolMetadata {
                    name,
                    description: description.into(),
                    parameters,
                    category,
                },
                binding,
            },
        );
        Ok(())
    }

    pub fn metadata(&self, name: &str) -> Option<&ToolMetadata> {
        self.tools.get(name).map(|t| &t.metadata)
    }

    pub fn all_metadata(&self) -> Vec<&ToolMetadata> {
        self.tools.values().map(|t| &t.metadata).collect()
    }

    pub fn metadata_by_category(&self) -> HashMap<String, Vec<&ToolMetadata>> {
        let mut grouped: HashMap<String, Vec<&ToolMetadata>> = HashMap::new();
        for tool in self.tools.values() {
            grouped
                .entry(tool.metadata.category.clone())
                .or_default()
                .push(&tool.metadata);
        }
        grouped
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Dispatch a call to a registered [`ExecutionBinding::Function`] tool.
    ///
    /// Callers must check [`CustomToolRegistry::binding_kind`] first for `StreamCallback` tools;
    /// this method returns [`ToolError::NotFound`] if the name isn't registered and panics if
    /// invoked against a `StreamCallback` binding, since that path is handled entirely by the
    /// Controller/Gateway.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        match &tool.binding {
            ExecutionBinding::Function(f) => Ok(f.call(arguments).await),
            ExecutionBinding::StreamCallback => Err(ToolError::ExecutionFailed(format!(
                "{} is a stream-callback tool and must be dispatched by the Controller",
                name
            ))),
        }
    }

    pub fn is_stream_callback(&self, name: &str) -> bool {
        matches!(
            self.tools.get(name).map(|t| &t.binding),
            Some(ExecutionBinding::StreamCallback)
        )
    }

    /// Register the built-in scientific calculator as a reference `Function` binding.
    pub fn register_calculator(&mut self) -> Result<(), ToolError> {
        let calc = Calculator::new();
        self.register(
            "calculator",
            "Evaluates a mathematical expression and returns the numeric result.",
            vec![ToolParameter {
                name: "expression".to_string(),
                description: "The mathematical expression to evaluate.".to_string(),
                required: true,
                schema: serde_json::json!({"type": "string"}),
            }],
            "data",
            ExecutionBinding::Function(Arc::new(FnToolFunction(move |args: Value| {
                let calc = calc.clone();
                async move {
                    let expr = match args.get("expression").and_then(|v| v.as_str()) {
                        Some(e) => e.to_string(),
                        None => return ToolResult::error("missing required argument: expression"),
                    };
                    match calc.evaluate(&expr).await {
                        Ok(result) => ToolResult::ok(result.to_string()),
                        Err(e) => ToolResult::error(e.to_string()),
                    }
                }
            }))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_empty_category() {
        let mut registry = CustomToolRegistry::new();
        let err = registry
            .register(
                "my_tool",
                "does things",
                vec![],
                "",
                ExecutionBinding::StreamCallback,
            )
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidRegistration(_)));
    }

    #[test]
    fn register_rejects_virtual_tool_name_collision() {
        let mut registry = CustomToolRegistry::new();
        let err = registry
            .register(
                "get_prompt",
                "shadows a virtual tool",
                vec![],
                "data",
                ExecutionBinding::StreamCallback,
            )
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidRegistration(_)));
    }

    #[tokio::test]
    async fn calculator_registers_and_dispatches() {
        let mut registry = CustomToolRegistry::new();
        registry.register_calculator().unwrap();
        assert!(registry.contains("calculator"));

        let result = registry
            .call("calculator", serde_json::json!({"expression": "2 + 2"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "4");
    }

    #[tokio::test]
    async fn calling_unknown_tool_returns_not_found() {
        let registry = CustomToolRegistry::new();
        let err = registry.call("nonexistent", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn metadata_by_category_groups_tools() {
        let mut registry = CustomToolRegistry::new();
        registry.register_calculator().unwrap();
        let grouped = registry.metadata_by_category();
        assert_eq!(grouped.get("data").map(|v| v.len()), Some(1));
    }
}
