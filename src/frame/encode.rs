//! Deterministic encoders for complex payload values.
//!
//! Complex values (arrays of objects, nested mappings) are stored inside
//! frames as serialized strings so the tabular output stays byte-stable.
//! The canonical JSON form sorts object keys and renders floats at fixed
//! precision; pipe-delimited and header/rows forms mirror the layout the
//! downstream consumers already parse.

use serde_json::Value;

use super::DEFAULT_FLOAT_PRECISION;

/// Escape backslash, pipe and slash delimiters inside serialized payloads.
pub fn escape_delims(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('/', "\\/")
}

fn format_float(value: f64) -> String {
    if !value.is_finite() {
        return "null".to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        // Integral floats render without a fractional tail so int/float
        // payload drift does not change the hash.
        format!("{}", value as i64)
    } else {
        format!("{:.*}", DEFAULT_FLOAT_PRECISION, value)
    }
}

fn escape_json_string(value: &str, out: &mut String) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&format_float(n.as_f64().unwrap_or(f64::NAN)));
            }
        }
        Value::String(s) => escape_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                escape_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Serialize a JSON value with sorted object keys and fixed float precision.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Serialize scalars or flat arrays into a pipe-delimited string with a
/// trailing pipe. Mappings and nested values fall back to canonical JSON.
pub fn serialize_simple_list(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Array(items) => {
            if items.is_empty() {
                return String::new();
            }
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                let text = match item {
                    Value::String(s) => escape_delims(s),
                    Value::Null => String::new(),
                    Value::Array(_) | Value::Object(_) => escape_delims(&canonical_json(item)),
                    other => escape_delims(&canonical_json(other)),
                };
                parts.push(text);
            }
            format!("{}|", parts.join("|"))
        }
        Value::String(s) => format!("{}|", escape_delims(s)),
        other => format!("{}|", escape_delims(&canonical_json(other))),
    }
}

/// Serialize an array of objects into the `k1|k2/v1|v2/...` header/rows form.
/// Key order is the first item's order followed by the sorted remainder.
pub fn header_rows_serialize(value: &Value) -> String {
    let items = match value {
        Value::Null => return String::new(),
        Value::Array(items) => items,
        other => return escape_delims(&canonical_json(other)),
    };
    if items.is_empty() {
        return String::new();
    }

    let mut ordered_keys: Vec<String> = Vec::new();
    if let Some(Value::Object(first)) = items.first() {
        for key in first.keys() {
            if !ordered_keys.contains(key) {
                ordered_keys.push(key.clone());
            }
        }
    }
    let mut remaining: Vec<String> = Vec::new();
    for item in items.iter().skip(1) {
        if let Value::Object(map) = item {
            for key in map.keys() {
                if !ordered_keys.contains(key) && !remaining.contains(key) {
                    remaining.push(key.clone());
                }
            }
        }
    }
    remaining.sort();
    ordered_keys.extend(remaining);

    let mut rows: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let map = match item {
            Value::Object(map) => map,
            other => {
                rows.push(escape_delims(&canonical_json(other)));
                continue;
            }
        };
        let mut cells: Vec<String> = Vec::with_capacity(ordered_keys.len());
        for key in &ordered_keys {
            let cell = match map.get(key) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => escape_delims(s),
                Some(nested @ (Value::Array(_) | Value::Object(_))) => {
                    escape_delims(&canonical_json(nested))
                }
                Some(other) => escape_delims(&canonical_json(other)),
            };
            cells.push(cell);
        }
        rows.push(cells.join("|"));
    }

    format!("{}/{}", ordered_keys.join("|"), rows.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": null, "y": true}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":true,"z":null},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_fixed_floats() {
        let value = json!({"v": 10.5});
        assert_eq!(canonical_json(&value), r#"{"v":10.500000}"#);
        let whole = json!({"v": 10.0});
        assert_eq!(canonical_json(&whole), r#"{"v":10}"#);
    }

    #[test]
    fn test_simple_list_trailing_pipe() {
        assert_eq!(
            serialize_simple_list(&json!(["a", "b|c"])),
            "a|b\\|c|".to_string()
        );
        assert_eq!(serialize_simple_list(&json!([])), "");
        assert_eq!(serialize_simple_list(&Value::Null), "");
    }

    #[test]
    fn test_header_rows_round_shape() {
        let value = json!([
            {"name": "aspirin", "role": "agonist"},
            {"name": "ibuprofen", "affinity": 3.5}
        ]);
        let encoded = header_rows_serialize(&value);
        assert_eq!(encoded, "name|role|affinity/aspirin|agonist|/ibuprofen||3.500000");
    }

    #[test]
    fn test_escape_delims() {
        assert_eq!(escape_delims("a/b|c\\d"), "a\\/b\\|c\\\\d");
    }
}
