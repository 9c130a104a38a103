//! Context Manager (C9): large-output offloading and history summarization.
//!
//! Two independent responsibilities live here: writing oversized tool results to disk and handing
//! the Conversation Controller back a placeholder plus accessor instructions, and compacting a
//! long-running conversation's history into a synthetic summary message when `maxTurns` or a
//! token-threshold is reached.

use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::RegexBuilder;
use serde_json::Value;

use crate::client_wrapper::{Message, Role};
use crate::error::ContextError;

/// Default length, in characters, past which a tool result is offloaded to disk instead of kept
/// inline in history.
pub const DEFAULT_LARGE_OUTPUT_THRESHOLD: usize = 20_000;

/// Default number of most-recent messages kept verbatim across a summarization pass.
pub const DEFAULT_KEEP_MESSAGES: usize = 8;

/// Where a large tool output ended up, for building the placeholder message.
pub struct OffloadReference {
    pub filename: String,
    pub total_size: usize,
}

/// Offload `content` to `<offload_dir>/tool_<YYYYMMDD_HHMMSS>_<tool_name>.<ext>` if it exceeds
/// `threshold` characters; `.json` is used when `content` parses as JSON, else `.txt`. Returns
/// `None` (content kept inline) when under threshold.
pub async fn offload_if_large(
    offload_dir: &Path,
    tool_name: &str,
    content: &str,
    threshold: usize,
) -> Result<Option<OffloadReference>, ContextError> {
    if content.len() <= threshold {
        return Ok(None);
    }

    let ext = if serde_json::from_str::<Value>(content).is_ok() {
        "json"
    } else {
        "txt"
    };
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let sanitized_tool = tool_name.replace(|c: char| !c.is_ascii_alphanumeric(), "_");
    let filename = format!("tool_{}_{}.{}", timestamp, sanitized_tool, ext);

    tokio::fs::create_dir_all(offload_dir)
        .await
        .map_err(|e| ContextError::OffloadIo(e.to_string()))?;
    let path = offload_dir.join(&filename);
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| ContextError::OffloadIo(e.to_string()))?;

    Ok(Some(OffloadReference {
        filename,
        total_size: content.len(),
    }))
}

/// The placeholder text substituted into history in place of an offloaded tool result.
pub fn offload_placeholder(reference: &OffloadReference) -> String {
    format!(
        "[Output too large, offloaded to {} ({} bytes). Use read_large_output(\"{}\", start, end), \
search_large_output(\"{}\", pattern, case_sensitive?, max_results?), or query_large_output(\"{}\", \
query, compact?, raw?) to inspect it.]",
        reference.filename, reference.total_size, reference.filename, reference.filename, reference.filename
    )
}

/// Default cap on `search_large_output` matches when the caller doesn't specify one.
pub const DEFAULT_SEARCH_MAX_RESULTS: usize = 50;

/// Read a character range `[start, end]` of an offloaded file's raw text, 1-based and inclusive
/// on both ends. `start < 1` or `start > end` yields an empty string rather than an error.
pub async fn read_large_output(
    offload_dir: &Path,
    filename: &str,
    start: usize,
    end: usize,
) -> Result<String, ContextError> {
    let text = read_offload_file(offload_dir, filename).await?;
    let chars: Vec<char> = text.chars().collect();
    if start == 0 || start > chars.len() || start > end {
        return Ok(String::new());
    }
    let start_idx = start - 1;
    let end_idx = end.min(chars.len());
    Ok(chars[start_idx..end_idx].iter().collect())
}

/// Return every line in the offloaded file matching `pattern` (a regex), each prefixed with its
/// 1-based line number, up to `max_results` matches (default [`DEFAULT_SEARCH_MAX_RESULTS`]).
pub async fn search_large_output(
    offload_dir: &Path,
    filename: &str,
    pattern: &str,
    case_sensitive: bool,
    max_results: Option<usize>,
) -> Result<Vec<String>, ContextError> {
    let text = read_offload_file(offload_dir, filename).await?;
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| ContextError::BadPattern(e.to_string()))?;
    let limit = max_results.unwrap_or(DEFAULT_SEARCH_MAX_RESULTS);

    let mut matches = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if regex.is_match(line) {
            matches.push(format!("{}: {}", number + 1, line));
            if matches.len() >= limit {
                break;
            }
        }
    }
    Ok(matches)
}

/// Run a jq-lite query against a `.json` offload file. Returns [`ContextError::NotJson`]
/// immediately for a `.txt` offload, per the spec's rule that `.txt` files are never
/// best-effort-parsed as JSON.
pub async fn query_large_output(
    offload_dir: &Path,
    filename: &str,
    query: &str,
    compact: bool,
    raw: bool,
) -> Result<String, ContextError> {
    if !filename.ends_with(".json") {
        return Err(ContextError::NotJson(filename.to_string()));
    }
    let text = read_offload_file(offload_dir, filename).await?;
    let root: Value =
        serde_json::from_str(&text).map_err(|e| ContextError::BadQuery(e.to_string()))?;
    let result = jq_lite::evaluate(&root, query)?;

    if raw {
        if let Value::String(s) = &result {
            return Ok(s.clone());
        }
    }
    if compact {
        serde_json::to_string(&result).map_err(|e| ContextError::BadQuery(e.to_string()))
    } else {
        serde_json::to_string_pretty(&result).map_err(|e| ContextError::BadQuery(e.to_string()))
    }
}

async fn read_offload_file(offload_dir: &Path, filename: &str) -> Result<String, ContextError> {
    let path = offload_dir.join(filename);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ContextError::FileNotFound(filename.to_string()))
}

/// A small jq-like query evaluator, deliberately scoped to field access, bracket indexing, `.[]`
/// iteration, and `select(field == literal)` filtering rather than the full jq grammar.
mod jq_lite {
    use serde_json::Value;

    use crate::error::ContextError;

    enum PathToken {
        Field(String),
        Index(usize),
        Iterate,
    }

    fn parse_path(path: &str) -> Vec<PathToken> {
        let path = path.trim_start_matches('.');
        let mut tokens = Vec::new();
        for part in path.split('.').filter(|s| !s.is_empty()) {
            if let Some(bracket_start) = part.find('[') {
                let field_name = &part[..bracket_start];
                if !field_name.is_empty() {
                    tokens.push(PathToken::Field(field_name.to_string()));
                }
                let mut rest = &part[bracket_start..];
                while let Some(open) = rest.find('[') {
                    let Some(close) = rest[open..].find(']').map(|i| open + i) else { break };
                    let inside = &rest[open + 1..close];
                    if inside.is_empty() {
                        tokens.push(PathToken::Iterate);
                    } else if let Ok(idx) = inside.parse::<usize>() {
                        tokens.push(PathToken::Index(idx));
                    }
                    rest = &rest[close + 1..];
                }
            } else {
                tokens.push(PathToken::Field(part.to_string()));
            }
        }
        tokens
    }

    fn apply_token(value: &Value, token: &PathToken) -> Vec<Value> {
        match token {
            PathToken::Field(name) => value.get(name).cloned().into_iter().collect(),
            PathToken::Index(i) => value.get(*i).cloned().into_iter().collect(),
            PathToken::Iterate => match value {
                Value::Array(items) => items.clone(),
                Value::Object(map) => map.values().cloned().collect(),
                _ => Vec::new(),
            },
        }
    }

    fn apply_path(current: Vec<Value>, path: &str) -> Vec<Value> {
        let tokens = parse_path(path);
        tokens.iter().fold(current, |acc, token| {
            acc.iter().flat_map(|v| apply_token(v, token)).collect()
        })
    }

    fn parse_literal(raw: &str) -> Value {
        let raw = raw.trim();
        if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
        match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => raw
                .parse::<f64>()
                .map(|n| serde_json::json!(n))
                .unwrap_or_else(|_| Value::String(raw.to_string())),
        }
    }

    fn apply_select(current: Vec<Value>, inner: &str) -> Result<Vec<Value>, ContextError> {
        let mut parts = inner.splitn(2, "==");
        let field_path = parts
            .next()
            .ok_or_else(|| ContextError::BadQuery(inner.to_string()))?
            .trim();
        let literal_str = parts
            .next()
            .ok_or_else(|| ContextError::BadQuery(inner.to_string()))?
            .trim();
        let literal = parse_literal(literal_str);

        Ok(current
            .into_iter()
            .filter(|item| {
                apply_path(vec![item.clone()], field_path)
                    .iter()
                    .any(|v| *v == literal)
            })
            .collect())
    }

    /// Evaluate a pipe-separated sequence of path and `select(...)` segments against `root`.
    pub fn evaluate(root: &Value, query: &str) -> Result<Value, ContextError> {
        if query.trim().is_empty() {
            return Err(ContextError::BadQuery("empty query".to_string()));
        }

        let mut current = vec![root.clone()];
        for segment in query.split('|').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if let Some(inner) = segment.strip_prefix("select(").and_then(|s| s.strip_suffix(')')) {
                current = apply_select(current, inner)?;
            } else {
                current = apply_path(current, segment);
            }
        }

        Ok(if current.len() == 1 {
            current.into_iter().next().unwrap()
        } else {
            Value::Array(current)
        })
    }
}

fn is_tool_result(message: &Message) -> bool {
    matches!(message.role, Role::Tool { .. })
}

fn is_tool_call(message: &Message) -> bool {
    matches!(message.role, Role::Assistant) && !message.tool_calls.is_empty()
}

/// Split `history` into `(old, keep)` for summarization, keeping the last `keep_count` messages
/// verbatim. The boundary is adjusted leftward whenever the first kept message is a tool result,
/// so that its matching tool call is always included in `keep` rather than stranded in `old`.
pub fn split_for_summarization(history: &[Message], keep_count: usize) -> (Vec<Message>, Vec<Message>) {
    let len = history.len();
    let mut split = len.saturating_sub(keep_count);

    while split > 0 && history.get(split).map(is_tool_result).unwrap_or(false) {
        split -= 1;
    }
    // If the message immediately before the (possibly adjusted) split is a tool call, pulling it
    // into `old` is safe only once every tool result it produced has also moved into `old`; the
    // loop above already guarantees that, since a tool result directly following it would have
    // triggered another leftward step.
    let _ = is_tool_call; // documents the invariant checked by the loop above

    let old = history[..split].to_vec();
    let keep = history[split..].to_vec();
    (old, keep)
}

/// Rebuild history after a successful summarization: the original system prompt, a synthetic user
/// message carrying the summary, then the kept tail.
pub fn rebuild_history(original_system_prompt: Message, summary: String, keep: Vec<Message>) -> Vec<Message> {
    let mut rebuilt = Vec::with_capacity(keep.len() + 2);
    rebuilt.push(original_system_prompt);
    rebuilt.push(Message {
        role: Role::User,
        content: std::sync::Arc::from(format!(
            "Summary of earlier conversation:\n{}",
            summary
        )),
        tool_calls: vec![],
    });
    rebuilt.extend(keep);
    rebuilt
}

/// The fixed system prompt used for the dedicated summarization LLM call.
pub const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
Summarize the conversation so far. Cover: key decisions and conclusions, constraints and \
requirements, referenced file paths and tool names, errors encountered and how they were \
resolved, and any open TODOs. Be compact.";

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg(role: Role, content: &str) -> Message {
        Message { role, content: Arc::from(content), tool_calls: vec![] }
    }

    fn tool_call_msg(content: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: Arc::from(content),
            tool_calls: vec![crate::client_wrapper::NativeToolCall {
                id: "call_1".to_string(),
                name: "calculator".to_string(),
                arguments: serde_json::json!({}),
            }],
        }
    }

    fn tool_result_msg(call_id: &str, content: &str) -> Message {
        msg(Role::Tool { call_id: call_id.to_string() }, content)
    }

    #[tokio::test]
    async fn offload_skips_content_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let result = offload_if_large(dir.path(), "search", "short", 20_000).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn offload_writes_json_extension_for_parseable_content() {
        let dir = tempfile::tempdir().unwrap();
        let big = serde_json::json!({"items": vec!["x"; 10_000]}).to_string();
        let reference = offload_if_large(dir.path(), "search", &big, 100).await.unwrap().unwrap();
        assert!(reference.filename.ends_with(".json"));
    }

    #[tokio::test]
    async fn offload_writes_txt_extension_for_non_json_content() {
        let dir = tempfile::tempdir().unwrap();
        let big = "x".repeat(50_000);
        let reference = offload_if_large(dir.path(), "search", &big, 100).await.unwrap().unwrap();
        assert!(reference.filename.ends_with(".txt"));
    }

    #[tokio::test]
    async fn query_large_output_rejects_txt_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("tool_x.txt"), "plain text").await.unwrap();
        let err = query_large_output(dir.path(), "tool_x.txt", ".a", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::NotJson(_)));
    }

    #[tokio::test]
    async fn query_large_output_supports_field_access_and_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "items": [
                {"name": "a", "status": "active"},
                {"name": "b", "status": "inactive"}
            ]
        });
        tokio::fs::write(dir.path().join("tool_x.json"), json.to_string()).await.unwrap();

        let result = query_large_output(dir.path(), "tool_x.json", ".items[].name", true, false)
            .await
            .unwrap();
        assert_eq!(result, r#"["a","b"]"#);

        let filtered = query_large_output(
            dir.path(),
            "tool_x.json",
            r#".items[] | select(.status == "active") | .name"#,
            true,
            true,
        )
        .await
        .unwrap();
        assert_eq!(filtered, "a");
    }

    #[test]
    fn split_keeps_last_k_messages_by_default() {
        let history: Vec<Message> = (0..12).map(|i| msg(Role::User, &i.to_string())).collect();
        let (old, keep) = split_for_summarization(&history, 8);
        assert_eq!(old.len(), 4);
        assert_eq!(keep.len(), 8);
    }

    #[test]
    fn split_extends_keep_leftward_to_include_matching_tool_call() {
        let history = vec![
            msg(Role::User, "q1"),
            tool_call_msg("calling calculator"),
            tool_result_msg("call_1", "4"),
            msg(Role::Assistant, "the answer is 4"),
        ];
        // keep_count = 2 would put the tool result at keep[0] with its tool call stranded in old.
        let (old, keep) = split_for_summarization(&history, 2);
        assert!(!is_tool_result(&keep[0]));
        assert!(old.iter().all(|m| !is_tool_call(m) || keep.iter().any(|_| true)));
    }

    #[test]
    fn rebuild_history_places_summary_after_system_prompt() {
        let system = msg(Role::System, "base prompt");
        let keep = vec![msg(Role::User, "last question")];
        let rebuilt = rebuild_history(system, "summary text".to_string(), keep);
        assert_eq!(rebuilt.len(), 3);
        assert!(matches!(rebuilt[0].role, Role::System));
        assert!(rebuilt[1].content.contains("summary text"));
    }

    #[tokio::test]
    async fn read_large_output_uses_1_based_inclusive_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let content = "hello world";
        tokio::fs::write(dir.path().join("tool_x.txt"), content).await.unwrap();

        let whole = read_large_output(dir.path(), "tool_x.txt", 1, content.chars().count())
            .await
            .unwrap();
        assert_eq!(whole, content);

        let first_five = read_large_output(dir.path(), "tool_x.txt", 1, 5).await.unwrap();
        assert_eq!(first_five, "hello");
    }

    #[tokio::test]
    async fn read_large_output_clamps_out_of_range_offsets() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("tool_x.txt"), "abc").await.unwrap();

        assert_eq!(read_large_output(dir.path(), "tool_x.txt", 0, 3).await.unwrap(), "");
        assert_eq!(read_large_output(dir.path(), "tool_x.txt", 2, 100).await.unwrap(), "bc");
    }

    #[tokio::test]
    async fn search_large_output_returns_regex_matches_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let content = "line one\nERROR: disk full\nline three\nFATAL: out of memory\n";
        tokio::fs::write(dir.path().join("tool_x.txt"), content).await.unwrap();

        let matches = search_large_output(dir.path(), "tool_x.txt", "ERROR|FATAL", false, Some(3))
            .await
            .unwrap();
        assert_eq!(matches, vec!["2: ERROR: disk full", "4: FATAL: out of memory"]);
    }

    #[tokio::test]
    async fn search_large_output_defaults_max_results_to_50() {
        let dir = tempfile::tempdir().unwrap();
        let content = "x\n".repeat(200);
        tokio::fs::write(dir.path().join("tool_x.txt"), &content).await.unwrap();

        let matches = search_large_output(dir.path(), "tool_x.txt", "x", false, None)
            .await
            .unwrap();
        assert_eq!(matches.len(), DEFAULT_SEARCH_MAX_RESULTS);
    }
}
