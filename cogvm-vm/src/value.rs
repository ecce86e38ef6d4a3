//! # Values
//!
//! Every payload in the VM is a `serde_json::Value`. This module holds the
//! structural rules the interpreter applies to them: truthiness, size
//! estimates, path expressions, slicing, chunking and merging.

use crate::opcode::Range;
use serde_json::Value;

/// Truthiness used by BRANCH and ASSERT.
///
/// Null, `false`, zero, and empty strings, sequences and mappings are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Approximate token count of a value (4 chars per token)
pub fn estimate_tokens(value: &Value) -> usize {
    value.to_string().len() / 4 + 1
}

/// Short type name for error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Split a path expression like `content.data` or `files.0` into its root
/// and remaining segments. Returns `None` if the text is not a path.
pub fn parse_path(expr: &str) -> Option<(&str, Vec<&str>)> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }
    let mut segments = expr.split('.');
    let root = segments.next()?;
    let rest: Vec<&str> = segments.collect();
    let valid = |s: &str| {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if !valid(root) || !rest.iter().all(|s| valid(s)) {
        return None;
    }
    Some((root, rest))
}

/// Walk `segments` into a value. Numeric segments index sequences.
pub fn lookup<'v>(value: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Clamped sub-slice of a sequence (by element) or string (by char).
/// Other shapes are returned unchanged.
pub fn slice(value: &Value, range: &Range) -> Value {
    match value {
        Value::Array(items) => {
            let (start, end) = clamp(range, items.len());
            Value::Array(items[start..end].to_vec())
        }
        Value::String(s) => {
            let len = s.chars().count();
            let (start, end) = clamp(range, len);
            Value::String(s.chars().skip(start).take(end - start).collect())
        }
        other => other.clone(),
    }
}

fn clamp(range: &Range, len: usize) -> (usize, usize) {
    let start = range.start.min(len);
    let end = range.end.clamp(start, len);
    (start, end)
}

/// Split a value into chunks of roughly `chunk_tokens` each.
///
/// Strings are cut on char boundaries, sequences are grouped by element and
/// never split an element. Anything else is a single chunk.
pub fn chunk(value: &Value, chunk_tokens: usize) -> Vec<Value> {
    match value {
        Value::String(s) => {
            let width = chunk_tokens.saturating_mul(4).max(1);
            let chars: Vec<char> = s.chars().collect();
            chars
                .chunks(width)
                .map(|c| Value::String(c.iter().collect()))
                .collect()
        }
        Value::Array(items) => {
            let mut chunks = Vec::new();
            let mut current = Vec::new();
            let mut current_tokens = 0;
            for item in items {
                let tokens = estimate_tokens(item);
                if !current.is_empty() && current_tokens + tokens > chunk_tokens {
                    chunks.push(Value::Array(std::mem::take(&mut current)));
                    current_tokens = 0;
                }
                current.push(item.clone());
                current_tokens += tokens;
            }
            if !current.is_empty() {
                chunks.push(Value::Array(current));
            }
            chunks
        }
        other => vec![other.clone()],
    }
}

/// Concatenate page contents in order.
///
/// If every value is a sequence the result is their concatenation, with the
/// separator inserted as an element when one is given. Otherwise the values
/// are joined as text.
pub fn merge(values: Vec<Value>, separator: Option<&str>) -> Value {
    if !values.is_empty() && values.iter().all(Value::is_array) {
        let mut merged = Vec::new();
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                if let Some(sep) = separator.filter(|s| !s.is_empty()) {
                    merged.push(Value::String(sep.to_string()));
                }
            }
            if let Value::Array(items) = value {
                merged.extend(items);
            }
        }
        return Value::Array(merged);
    }

    let parts: Vec<String> = values.iter().map(render_text).collect();
    Value::String(parts.join(separator.unwrap_or("")))
}

/// Strings as-is, everything else as compact JSON
pub fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One-line preview used by traces and pretty printing
pub fn brief(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", truncate(s, 20)),
        Value::Array(a) => format!("[{} items]", a.len()),
        Value::Object(o) => {
            let keys: Vec<_> = o.keys().take(3).cloned().collect();
            if keys.len() < o.len() {
                format!("{{{}, …}}", keys.join(", "))
            } else {
                format!("{{{}}}", keys.join(", "))
            }
        }
    }
}

/// Truncate on a char boundary, marking the cut with an ellipsis
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
