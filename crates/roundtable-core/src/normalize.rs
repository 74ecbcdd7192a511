//! Canonical argument keys for dedup and caching.
//!
//! Two tool calls are the same call when they agree on the tool name and on
//! their arguments modulo key ordering and volatile fields (timestamps,
//! request/session/trace identifiers). The canonical key makes that
//! comparison a string equality.

use std::hash::{DefaultHasher, Hash, Hasher};

use serde_json::Value;

/// Argument fields stripped before key computation. These vary between
/// semantically identical calls and would defeat deduplication.
const VOLATILE_FIELDS: &[&str] = &[
    "timestamp",
    "time",
    "created_at",
    "createdAt",
    "request_id",
    "requestId",
    "session_id",
    "sessionId",
    "trace_id",
    "traceId",
    "span_id",
    "spanId",
];

fn is_volatile(key: &str) -> bool {
    VOLATILE_FIELDS.iter().any(|field| *field == key)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|key| !is_volatile(key)).collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Normalize a structured value to a canonical string: object keys sorted,
/// volatile fields stripped, recursively.
pub fn normalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical key for a tool call with parsed arguments.
pub fn canonical_key(tool_name: &str, arguments: &Value) -> String {
    format!("{}:{}", tool_name, normalize(arguments))
}

/// Canonical key for a tool call whose raw argument string may not parse.
/// Unparseable arguments fall back to a content hash of the raw string so
/// dedup degrades instead of failing.
pub fn canonical_key_raw(tool_name: &str, raw_arguments: &str) -> String {
    match serde_json::from_str::<Value>(raw_arguments) {
        Ok(value) => canonical_key(tool_name, &value),
        Err(_) => {
            let mut hasher = DefaultHasher::new();
            raw_arguments.hash(&mut hasher);
            format!("{}:raw:{:016x}", tool_name, hasher.finish())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"folder": "inbox", "title": "X"});
        let b = json!({"title": "X", "folder": "inbox"});
        assert_eq!(canonical_key("create_note", &a), canonical_key("create_note", &b));
    }

    #[test]
    fn volatile_fields_are_stripped() {
        let a = json!({"query": "rust", "timestamp": 1_700_000_000, "request_id": "r-1"});
        let b = json!({"query": "rust", "timestamp": 1_700_000_999, "requestId": "r-2"});
        assert_eq!(canonical_key("search_notes", &a), canonical_key("search_notes", &b));
    }

    #[test]
    fn nested_objects_are_normalized() {
        let a = json!({"filter": {"b": 2, "a": 1, "trace_id": "t-1"}});
        let b = json!({"filter": {"a": 1, "b": 2}});
        assert_eq!(canonical_key("list_notes", &a), canonical_key("list_notes", &b));
    }

    #[test]
    fn different_arguments_differ() {
        let a = json!({"query": "rust"});
        let b = json!({"query": "tokio"});
        assert_ne!(canonical_key("search_notes", &a), canonical_key("search_notes", &b));
    }

    #[test]
    fn arrays_preserve_order() {
        let a = json!({"ids": [1, 2, 3]});
        let b = json!({"ids": [3, 2, 1]});
        assert_ne!(canonical_key("get_notes", &a), canonical_key("get_notes", &b));
    }

    #[test]
    fn unparseable_arguments_fall_back_to_content_hash() {
        let key_a = canonical_key_raw("search_notes", "not json {{{");
        let key_b = canonical_key_raw("search_notes", "not json {{{");
        let key_c = canonical_key_raw("search_notes", "other garbage");
        assert_eq!(key_a, key_b);
        assert_ne!(key_a, key_c);
        assert!(key_a.starts_with("search_notes:raw:"));
    }

    #[test]
    fn parseable_raw_matches_structured_key() {
        let value = json!({"query": "rust"});
        assert_eq!(
            canonical_key_raw("search_notes", "{\"query\":\"rust\"}"),
            canonical_key("search_notes", &value)
        );
    }
}
