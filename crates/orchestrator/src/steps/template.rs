//! `{{name}}` placeholder substitution in JSON values.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::StepError;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("Invalid placeholder regex")
    })
}

/// Substitute placeholders in every string inside `value`.
///
/// A string that is exactly one placeholder takes the variable's JSON value
/// as-is, so numbers and objects keep their type. Anything else is
/// interpolated as text.
pub fn render(value: &Value, vars: &Map<String, Value>) -> Result<Value, StepError> {
    match value {
        Value::String(s) => render_string(s, vars),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut rendered = Map::with_capacity(fields.len());
            for (key, field) in fields {
                rendered.insert(key.clone(), render(field, vars)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Like [`render`], always producing text.
pub fn render_text(text: &str, vars: &Map<String, Value>) -> Result<String, StepError> {
    match render_string(text, vars)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn render_string(text: &str, vars: &Map<String, Value>) -> Result<Value, StepError> {
    let pattern = placeholder();

    if let Some(caps) = pattern.captures(text) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
            return lookup(&caps[1], vars).cloned();
        }
    } else {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in pattern.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        match lookup(&caps[1], vars)? {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

fn lookup<'a>(name: &str, vars: &'a Map<String, Value>) -> Result<&'a Value, StepError> {
    vars.get(name)
        .ok_or_else(|| StepError::MissingVariable(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({"vlan": 10, "name": "prod", "spec": {"a": 1}})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let out = render(&json!({"id": "{{vlan}}", "spec": "{{ spec }}"}), &vars()).unwrap();
        assert_eq!(out, json!({"id": 10, "spec": {"a": 1}}));
    }

    #[test]
    fn test_interpolation() {
        let out = render(&json!(["vlan-{{vlan}}-{{name}}", 3, null]), &vars()).unwrap();
        assert_eq!(out, json!(["vlan-10-prod", 3, null]));
        assert_eq!(render_text("subnets/{{name}}", &vars()).unwrap(), "subnets/prod");
    }

    #[test]
    fn test_missing_variable() {
        let err = render(&json!("{{nope}}"), &vars()).unwrap_err();
        assert!(matches!(err, StepError::MissingVariable(name) if name == "nope"));
    }
}
