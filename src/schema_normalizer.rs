//! Schema Normalizer (C6): fixes up JSON Schemas discovered from MCP servers so that every
//! provider's function-calling API accepts them.
//!
//! Normalization is idempotent: running it twice on an already-normalized schema produces the
//! same output (every rule either fixes an issue or is a no-op on schemas that already satisfy
//! it).

use serde_json::{Map, Value};

/// How many `items`-injection fixes were applied, for debug logging (§4.6).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeStats {
    pub missing_items_fixed: usize,
}

/// Normalize a tool's JSON Schema in place, applying the four rules in order:
///
/// 1. An array property with no `items` gets `items: {"type": "string"}` injected.
/// 2. An empty `properties` object is removed.
/// 3. An empty `required` array is removed.
/// 4. The walk descends into nested `properties` and `items`.
pub fn normalize(schema: &Value) -> (Value, NormalizeStats) {
    let mut stats = NormalizeStats::default();
    let normalized = normalize_node(schema, &mut stats);
    (normalized, stats)
}

fn normalize_node(node: &Value, stats: &mut NormalizeStats) -> Value {
    let mut node = match node {
        Value::Object(map) => map.clone(),
        other => return other.clone(),
    };

    if node.get("type").and_then(Value::as_str) == Some("array") && !node.contains_key("items") {
        node.insert("items".to_string(), serde_json::json!({"type": "string"}));
        stats.missing_items_fixed += 1;
    }

    if let Some(Value::Object(props)) = node.get("properties") {
        if props.is_empty() {
            node.remove("properties");
        }
    }

    if let Some(Value::Array(required)) = node.get("required") {
        if required.is_empty() {
            node.remove("required");
        }
    }

    if let Some(Value::Object(props)) = node.get("properties") {
        let mut normalized_props = Map::new();
        for (key, value) in props {
            normalized_props.insert(key.clone(), normalize_node(value, stats));
        }
        node.insert("properties".to_string(), Value::Object(normalized_props));
    }

    if let Some(items) = node.get("items") {
        let normalized_items = normalize_node(items, stats);
        node.insert("items".to_string(), normalized_items);
    }

    Value::Object(node)
}

/// Round-trip a schema through JSON serialization, guaranteeing that whatever internal
/// representation a caller holds for "tool parameters" survives as a structurally identical
/// `serde_json::Value`. A no-op for values that are already `serde_json::Value`, but kept as an
/// explicit step so callers converting from a typed parameters struct get the same guarantee.
pub fn roundtrip<T: serde::Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    let text = serde_json::to_string(value)?;
    serde_json::from_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_items_for_array_without_one() {
        let schema = serde_json::json!({"type": "array"});
        let (normalized, stats) = normalize(&schema);
        assert_eq!(normalized["items"]["type"], "string");
        assert_eq!(stats.missing_items_fixed, 1);
    }

    #[test]
    fn leaves_array_with_items_untouched() {
        let schema = serde_json::json!({"type": "array", "items": {"type": "number"}});
        let (normalized, stats) = normalize(&schema);
        assert_eq!(normalized["items"]["type"], "number");
        assert_eq!(stats.missing_items_fixed, 0);
    }

    #[test]
    fn removes_empty_properties_and_required() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        });
        let (normalized, _) = normalize(&schema);
        assert!(normalized.get("properties").is_none());
        assert!(normalized.get("required").is_none());
    }

    #[test]
    fn descends_into_nested_properties() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array"}
            }
        });
        let (normalized, stats) = normalize(&schema);
        assert_eq!(normalized["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(stats.missing_items_fixed, 1);
    }

    #[test]
    fn normalization_is_idempotent() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array"}
            },
            "required": []
        });
        let (once, _) = normalize(&schema);
        let (twice, stats_twice) = normalize(&once);
        assert_eq!(once, twice);
        assert_eq!(stats_twice.missing_items_fixed, 0);
    }
}
