//! `{{ steps.<id>.output(.<field>)* }}` references in step arguments.
//!
//! Substitution is purely syntactic. A string that is exactly one
//! reference is replaced by the referenced JSON value (keeping its type);
//! references embedded in longer strings are spliced in as text. Missing
//! steps or fields are errors, never empty strings.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step: String,
    /// Object keys or array indices below `output`.
    pub path: Vec<String>,
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "steps.{}.output", self.step)?;
        for p in &self.path {
            write!(f, ".{}", p)?;
        }
        Ok(())
    }
}

/// A `{{ ... }}` span inside a string, with byte offsets.
struct Span<'a> {
    start: usize,
    end: usize,
    inner: &'a str,
}

fn spans(s: &str) -> Vec<Span<'_>> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(open) = s[from..].find("{{") {
        let start = from + open;
        let Some(close) = s[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        out.push(Span {
            start,
            end,
            inner: s[start + 2..end - 2].trim(),
        });
        from = end;
    }
    out
}

/// Parse the inside of a `{{ }}` span. `None` when it is not a step
/// reference at all (left as literal text).
fn parse(inner: &str) -> Option<Result<Reference, String>> {
    let rest = inner.strip_prefix("steps.")?;
    let mut parts = rest.split('.');
    let step = parts.next().unwrap_or_default();
    if step.is_empty()
        || !step
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Some(Err(format!("bad step id in reference '{}'", inner)));
    }
    if parts.next() != Some("output") {
        return Some(Err(format!(
            "reference '{}' must have the form steps.<id>.output(.<field>)*",
            inner
        )));
    }
    let path: Vec<String> = parts.map(|p| p.trim().to_string()).collect();
    if path.iter().any(|p| p.is_empty()) {
        return Some(Err(format!("empty field in reference '{}'", inner)));
    }
    Some(Ok(Reference {
        step: step.to_string(),
        path,
    }))
}

/// Every reference in `value`, in document order.
pub fn references(value: &Value) -> Result<Vec<Reference>, String> {
    let mut out = Vec::new();
    collect(value, &mut out)?;
    Ok(out)
}

fn collect(value: &Value, out: &mut Vec<Reference>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for span in spans(s) {
                if let Some(r) = parse(span.inner) {
                    out.push(r?);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect(v, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute references in `value` from completed step outputs.
pub fn resolve(value: &Value, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    match value {
        Value::String(s) => resolve_str(s, outputs),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, outputs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(s: &str, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    let found = spans(s);
    if found.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // Whole-string reference keeps the JSON type.
    if found.len() == 1 && found[0].start == 0 && found[0].end == s.len() {
        if let Some(r) = parse(found[0].inner) {
            return lookup(&r?, outputs);
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for span in found {
        out.push_str(&s[last..span.start]);
        match parse(span.inner) {
            Some(r) => match lookup(&r?, outputs)? {
                Value::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            },
            None => out.push_str(&s[span.start..span.end]),
        }
        last = span.end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn lookup(r: &Reference, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    let mut current = outputs
        .get(&r.step)
        .cloned()
        .ok_or_else(|| format!("unresolved reference '{}': step '{}' has no output", r, r.step))?;
    for field in &r.path {
        // Tool outputs are often JSON encoded as text.
        if let Value::String(text) = &current {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                if parsed.is_object() || parsed.is_array() {
                    current = parsed;
                }
            }
        }
        let next = match &current {
            Value::Object(map) => map.get(field).cloned(),
            Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            _ => None,
        };
        current = next.ok_or_else(|| format!("unresolved reference '{}': no field '{}'", r, field))?;
    }
    Ok(current)
}
