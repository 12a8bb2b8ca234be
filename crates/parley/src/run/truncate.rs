//! Event payload size discipline.
//!
//! Chunks are stored verbatim when under their type's character budget.
//! Oversized chunks are shrunk (strings cut, arrays capped, nesting depth
//! capped) and, if the shrunk form still overflows, replaced by a minimal
//! `{"type": ..., "truncated": true}` marker so the log never stores a raw
//! payload above the ceiling.

use serde_json::{json, Map, Value};

use crate::config::TruncationConfig;

/// Bound a serialized event chunk to its configured ceiling.
///
/// `parsed` is the already-parsed form of `original`; tool events
/// (`tool-*` types) use the smaller budget.
pub fn truncate_event_chunk(
    limits: &TruncationConfig,
    parsed: &Value,
    original: &str,
) -> String {
    let kind = parsed
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let limit = if kind.starts_with("tool-") {
        limits.tool_event_max_chars
    } else {
        limits.max_event_chars
    };

    if original.len() <= limit {
        return original.to_string();
    }

    let shrunk = truncate_json_value(limits, parsed, 0);
    let serialized = shrunk.to_string();
    if serialized.len() <= limit {
        return serialized;
    }

    let kind = if kind.is_empty() { "event" } else { &kind };
    json!({ "type": kind, "truncated": true }).to_string()
}

fn truncate_json_value(limits: &TruncationConfig, value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => {
            if s.chars().count() > limits.max_string_chars {
                Value::String(s.chars().take(limits.max_string_chars).collect())
            } else {
                value.clone()
            }
        }
        Value::Array(items) => {
            if depth >= limits.max_depth {
                return value.clone();
            }
            Value::Array(
                items
                    .iter()
                    .take(limits.max_array_length)
                    .map(|item| truncate_json_value(limits, item, depth + 1))
                    .collect(),
            )
        }
        Value::Object(fields) => {
            if depth >= limits.max_depth {
                return value.clone();
            }
            let mut out = Map::with_capacity(fields.len());
            for (key, val) in fields {
                out.insert(key.clone(), truncate_json_value(limits, val, depth + 1));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}
