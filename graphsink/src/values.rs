//! Column value formatting rules shared by the batch compiler and the
//! write queue. Pure functions, no I/O.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

/// Sentinel distinguishing an absent key part from an explicit null.
pub const MISSING_KEY_PART: &str = "__missing__";

/// Column types rendered as ISO-8601 timestamps. Introspection emits either
/// the short or the long form depending on the backend version.
static TIMESTAMP_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "timestamp",
        "timestamptz",
        "timestamp with time zone",
        "timestamp without time zone",
    ])
});

pub fn is_timestamp_type(field_type: &str) -> bool {
    TIMESTAMP_TYPES.contains(field_type)
}

/// Column types with a leading underscore are array types.
pub fn is_array_type(field_type: &str) -> bool {
    field_type.starts_with('_')
}

pub fn is_json_type(field_type: &str) -> bool {
    matches!(field_type, "json" | "jsonb")
}

/// Renders a timestamp as ISO-8601 with an explicit offset.
///
/// Accepts RFC 3339 strings (offset preserved) and integer epoch
/// milliseconds; anything else passes through unchanged so the backend
/// reports the mismatch.
pub fn format_timestamp(value: &Value) -> Value {
    match value {
        Value::String(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Value::String(parsed.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Err(_) => value.clone(),
        },
        Value::Number(number) => match number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
        {
            Some(parsed) => Value::String(parsed.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Renders a JSON array as a Postgres array literal, e.g. `{"a","b"}`.
///
/// String elements are double-quoted with `"` and `\` escaped, nulls become
/// unquoted NULL, other scalars keep their JSON rendering.
pub fn format_array_literal(value: &Value) -> Value {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Null => return Value::Null,
        _ => return value.clone(),
    };
    let mut literal = String::from("{");
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            literal.push(',');
        }
        match item {
            Value::Null => literal.push_str("NULL"),
            Value::String(text) => {
                literal.push('"');
                for c in text.chars() {
                    if c == '"' || c == '\\' {
                        literal.push('\\');
                    }
                    literal.push(c);
                }
                literal.push('"');
            }
            other => literal.push_str(&other.to_string()),
        }
    }
    literal.push('}');
    Value::String(literal)
}

/// Deep-walks a json/jsonb payload replacing every strict RFC 3339 string
/// with its epoch-millisecond equivalent.
pub fn epoch_millis_deep(value: &Value) -> Value {
    match value {
        Value::String(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Value::Number(parsed.timestamp_millis().into()),
            Err(_) => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(epoch_millis_deep).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, nested)| (key.clone(), epoch_millis_deep(nested)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Normalizes one primary key part for identity comparison.
///
/// Timestamp parts collapse to epoch milliseconds so the same instant
/// written with different offsets yields the same key.
pub fn normalize_key_part(field_type: &str, value: &Value) -> Value {
    if is_timestamp_type(field_type) {
        match value {
            Value::String(raw) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                    return Value::Number(parsed.timestamp_millis().into());
                }
            }
            Value::Number(number) => {
                if let Some(millis) = number.as_i64() {
                    return Value::Number(millis.into());
                }
            }
            _ => {}
        }
    }
    value.clone()
}

/// Applies the boundary formatting rule for one column value.
pub fn format_column_value(field_type: &str, value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    if is_timestamp_type(field_type) {
        format_timestamp(value)
    } else if is_array_type(field_type) {
        format_array_literal(value)
    } else if is_json_type(field_type) {
        epoch_millis_deep(value)
    } else {
        value.clone()
    }
}
