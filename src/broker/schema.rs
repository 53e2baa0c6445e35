//! Argument validation against a tool's JSON Schema.
//!
//! Covers the subset tool servers actually publish: `type` (single or
//! list), `enum`, `required`, `properties`, `additionalProperties: false`,
//! `items`, and `default` injection for absent properties. Unknown keywords
//! are ignored.

use serde_json::{Map, Value};

/// Validate `args` and return them with defaults filled in.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<Value, String> {
    // Tools with no parameters are commonly called with `null`.
    let args = match args {
        Value::Null if expects_object(schema) => Value::Object(Map::new()),
        other => other.clone(),
    };
    validate_value("arguments", schema, &args)
}

fn expects_object(schema: &Value) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => t == "object",
        None => schema.get("properties").is_some(),
        _ => false,
    }
}

fn validate_value(path: &str, schema: &Value, value: &Value) -> Result<Value, String> {
    if !schema.is_object() {
        return Ok(value.clone());
    }

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(|t| t.as_str()).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            return Err(format!(
                "{} must be of type '{}', got {}",
                path,
                allowed.join("|"),
                json_type_name(value)
            ));
        }
    }

    if let Some(options) = schema.get("enum").and_then(|e| e.as_array()) {
        if !options.contains(value) {
            let listed: Vec<String> = options.iter().map(|v| v.to_string()).collect();
            return Err(format!(
                "{} must be one of [{}], got {}",
                path,
                listed.join(", "),
                value
            ));
        }
    }

    match value {
        Value::Object(obj) => validate_object(path, schema, obj),
        Value::Array(items) => {
            let Some(item_schema) = schema.get("items") else {
                return Ok(value.clone());
            };
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(validate_value(&format!("{}[{}]", path, i), item_schema, item)?);
            }
            Ok(Value::Array(out))
        }
        _ => Ok(value.clone()),
    }
}

fn validate_object(path: &str, schema: &Value, obj: &Map<String, Value>) -> Result<Value, String> {
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !obj.contains_key(name) {
                return Err(format!("{}: missing required property '{}'", path, name));
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        if let Some(extra) = obj.keys().find(|k| !properties.contains_key(*k)) {
            return Err(format!("{}: unexpected property '{}'", path, extra));
        }
    }

    let mut result = obj.clone();
    for (name, prop_schema) in &properties {
        match obj.get(name) {
            Some(v) => {
                let checked = validate_value(&format!("{}.{}", path, name), prop_schema, v)?;
                result.insert(name.clone(), checked);
            }
            None => {
                if let Some(default) = prop_schema.get("default") {
                    result.insert(name.clone(), default.clone());
                }
            }
        }
    }
    Ok(Value::Object(result))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
