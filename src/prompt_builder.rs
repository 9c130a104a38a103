//! Prompt Builder (C7): assembles the system prompt handed to the LLM for a turn.
//!
//! Builds a single string from a fixed template with placeholders, following the donor agent's
//! `augment_system_prompt` string-building style rather than a templating engine — the set of
//! sections is small and fully known at build time.

use chrono::{DateTime, Utc};

/// Which family of tool-invocation instructions to advertise to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// The model writes and executes code that calls tools as local functions.
    CodeExecution,
    /// The model must `search_tools` before it can `add_tool` to its active toolset.
    ToolSearch,
    /// The model calls tools directly, one at a time, from the full advertised set.
    DirectTool,
}

/// Everything the Prompt Builder needs to assemble one system prompt.
pub struct PromptInputs<'a> {
    pub mode: PromptMode,
    pub base_prompt: &'a str,
    pub server_prompt_inventories: &'a [(String, Vec<String>)],
    pub server_resource_inventories: &'a [(String, Vec<String>)],
    pub discover_resource: bool,
    pub discover_prompt: bool,
    pub tool_structure_json: Option<&'a str>,
    pub tool_categories: &'a [String],
    pub context_offloading_enabled: bool,
    pub now: DateTime<Utc>,
}

const CODE_EXECUTION_INSTRUCTIONS: &str = "\
You may write and execute code that calls the available tools as local functions. \
Prefer code execution over describing steps in prose when a task needs more than one tool call.";

const TOOL_SEARCH_INSTRUCTIONS: &str = "\
Call `search_tools` with a natural-language query to find tools relevant to the current task, \
then call `add_tool` to bring a result into your active toolset before invoking it.";

const DIRECT_TOOL_INSTRUCTIONS: &str = "\
Use the available tools one at a time. Wait for each tool's result before deciding on the next \
action.";

/// Build the system prompt for one turn.
pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(inputs.base_prompt);
    prompt.push_str("\n\n");
    prompt.push_str(&format!("Current date/time: {}\n\n", inputs.now.to_rfc3339()));

    match inputs.mode {
        PromptMode::CodeExecution => {
            prompt.push_str(CODE_EXECUTION_INSTRUCTIONS);
            prompt.push_str("\n\n");
            prompt.push_str(&tool_structure_section(inputs.tool_structure_json));
        }
        PromptMode::ToolSearch => {
            prompt.push_str(TOOL_SEARCH_INSTRUCTIONS);
            prompt.push('\n');
        }
        PromptMode::DirectTool => {
            prompt.push_str(DIRECT_TOOL_INSTRUCTIONS);
            prompt.push('\n');
        }
    }

    // Prompt/resource discovery sections are unreachable from executed code, so code-execution
    // mode suppresses them regardless of the discover_* flags.
    if inputs.mode != PromptMode::CodeExecution {
        if inputs.discover_prompt && has_any(inputs.server_prompt_inventories) {
            prompt.push('\n');
            prompt.push_str(&virtual_tool_section(
                "get_prompt",
                "Retrieve a named prompt template from a connected server.",
                inputs.server_prompt_inventories,
            ));
        }
        if inputs.discover_resource && has_any(inputs.server_resource_inventories) {
            prompt.push('\n');
            prompt.push_str(&virtual_tool_section(
                "get_resource",
                "Retrieve a named resource from a connected server.",
                inputs.server_resource_inventories,
            ));
        }
        if inputs.context_offloading_enabled {
            prompt.push('\n');
            prompt.push_str(
                "Large tool outputs may be offloaded to a file. Use `query_large_output` (JSON \
offloads only) or `read_large_output` to inspect them.\n",
            );
        }
    }

    if !inputs.tool_categories.is_empty() {
        prompt.push('\n');
        prompt.push_str(&format!(
            "Tool categories available: {}\n",
            inputs.tool_categories.join(", ")
        ));
    }

    prompt
}

fn has_any(inventories: &[(String, Vec<String>)]) -> bool {
    inventories.iter().any(|(_, items)| !items.is_empty())
}

fn tool_structure_section(tool_structure_json: Option<&str>) -> String {
    match tool_structure_json {
        Some(json) => format!("Available tool structure:\n{}\n", json),
        None => "No tool structure was supplied; call `discover_code_files` to inspect the \
available generated tool modules before writing code.\n"
            .to_string(),
    }
}

fn virtual_tool_section(
    tool_name: &str,
    description: &str,
    inventories: &[(String, Vec<String>)],
) -> String {
    let mut section = format!("`{}`: {}\n", tool_name, description);
    for (server, items) in inventories {
        if items.is_empty() {
            continue;
        }
        section.push_str(&format!("  {}: {}\n", server, items.join(", ")));
    }
    section
}

/// Extract a short preview of a prompt's description: its first 10 lines, with an optional
/// legacy `"\n\nContent:\n"` marker stripped, and an ellipsis note appended if truncated.
pub fn prompt_preview(description: &str) -> String {
    const LEGACY_MARKER: &str = "\n\nContent:\n";
    let description = match description.find(LEGACY_MARKER) {
        Some(idx) => &description[..idx],
        None => description,
    };

    let lines: Vec<&str> = description.lines().collect();
    if lines.len() <= 10 {
        return description.to_string();
    }

    let mut preview = lines[..10].join("\n");
    preview.push_str("\n... (truncated)");
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> PromptInputs<'static> {
        PromptInputs {
            mode: PromptMode::DirectTool,
            base_prompt: "You are a helpful assistant.",
            server_prompt_inventories: &[],
            server_resource_inventories: &[],
            discover_resource: false,
            discover_prompt: false,
            tool_structure_json: None,
            tool_categories: &[],
            context_offloading_enabled: false,
            now: Utc::now(),
        }
    }

    #[test]
    fn direct_tool_mode_includes_one_at_a_time_guidance() {
        let prompt = build_system_prompt(&base_inputs());
        assert!(prompt.contains("one at a time"));
    }

    #[test]
    fn code_execution_mode_suppresses_discovery_sections() {
        let mut inputs = base_inputs();
        inputs.mode = PromptMode::CodeExecution;
        inputs.discover_prompt = true;
        inputs.server_prompt_inventories = &[];
        let prompt = build_system_prompt(&inputs);
        assert!(prompt.contains("write and execute code") || prompt.contains("Prefer code execution"));
        assert!(!prompt.contains("get_prompt"));
    }

    #[test]
    fn tool_search_mode_mentions_search_and_add() {
        let mut inputs = base_inputs();
        inputs.mode = PromptMode::ToolSearch;
        let prompt = build_system_prompt(&inputs);
        assert!(prompt.contains("search_tools"));
        assert!(prompt.contains("add_tool"));
    }

    #[test]
    fn get_prompt_omitted_when_no_prompts_exist() {
        let mut inputs = base_inputs();
        inputs.discover_prompt = true;
        let prompt = build_system_prompt(&inputs);
        assert!(!prompt.contains("get_prompt"));
    }

    #[test]
    fn offload_accessors_only_listed_when_enabled_and_not_code_execution() {
        let mut inputs = base_inputs();
        inputs.context_offloading_enabled = true;
        let prompt = build_system_prompt(&inputs);
        assert!(prompt.contains("query_large_output"));

        let mut code_inputs = base_inputs();
        code_inputs.mode = PromptMode::CodeExecution;
        code_inputs.context_offloading_enabled = true;
        let code_prompt = build_system_prompt(&code_inputs);
        assert!(!code_prompt.contains("query_large_output"));
    }

    #[test]
    fn prompt_preview_strips_legacy_marker_and_truncates() {
        let description = format!(
            "Summary line\n\nContent:\n{}",
            (1..=20).map(|n| format!("line {}", n)).collect::<Vec<_>>().join("\n")
        );
        let preview = prompt_preview(&description);
        assert_eq!(preview, "Summary line");
    }

    #[test]
    fn prompt_preview_truncates_at_ten_lines_with_ellipsis() {
        let description = (1..=15).map(|n| format!("line {}", n)).collect::<Vec<_>>().join("\n");
        let preview = prompt_preview(&description);
        assert!(preview.ends_with("... (truncated)"));
        assert_eq!(preview.lines().count(), 11);
    }
}
