//! # Templating engine (§4.1)
//!
//! Pure function: given a template string and a Context, produce a rendered
//! string, preserving typed scalars when the entire template is a single
//! substitution. This replaces the old `${token}` interpolation — the marker
//! syntax is `{{ expr }}`, and `expr` is either a dotted path
//! (`entry.seed_data.customer_id`) or a reserved identifier (`correlation_id`).
//!
//! Recursion into nested maps/lists is depth-first, left-to-right. Templates
//! are side-effect-free: no I/O, no mutation of the Context.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::errors::{ErrorKind, ObservedError};

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\[\]-]+)\s*\}\}").expect("valid marker regex"));

/// Renders a template string to a string, stringifying any substituted value.
pub fn render(template: &str, ctx: &Context) -> Result<String, ObservedError> {
    match render_value(&Value::String(template.to_string()), ctx)? {
        Value::String(s) => Ok(s),
        other => Ok(stringify(&other)),
    }
}

/// Renders a template value. When `template` is a string consisting of exactly
/// one marker, the extracted value's original type is preserved (a number
/// stays a number, a list stays a list). When a marker is embedded in a larger
/// string, the substituted value is stringified. Objects and arrays are
/// recursed into depth-first, left-to-right.
pub fn render_value(template: &Value, ctx: &Context) -> Result<Value, ObservedError> {
    match template {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_value(item, ctx)?);
            }
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (k, v) in map {
                rendered.insert(k.clone(), render_value(v, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, ctx: &Context) -> Result<Value, ObservedError> {
    if let Some(sole_key) = sole_marker_key(s) {
        let value = resolve(&sole_key, ctx)?;
        return Ok(value.clone());
    }

    let mut out = String::new();
    let mut last = 0;
    for m in MARKER_RE.captures_iter(s) {
        let whole = m.get(0).unwrap();
        out.push_str(&s[last..whole.start()]);
        let key = m.get(1).unwrap().as_str();
        let value = resolve(key, ctx)?;
        out.push_str(&stringify(value));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// If `s` is exactly one marker (optionally surrounded by whitespace, but no
/// other text), returns the bare key inside it.
fn sole_marker_key(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    let key = inner.trim();
    if key.is_empty() || key.contains("{{") {
        None
    } else {
        Some(key.to_string())
    }
}

fn resolve<'a>(key: &str, ctx: &'a Context) -> Result<&'a Value, ObservedError> {
    ctx.get_path(key).ok_or_else(|| {
        ObservedError::new(
            ErrorKind::TemplateMissingKey,
            format!("template references unknown key '{key}'"),
        )
        .with_path(key.to_string())
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(key: &str, value: Value) -> Context {
        let base = Context::initial("r", "i", "c", 0, Value::Null);
        let mut delta = crate::context::ContextDelta::new();
        delta.insert(key, value);
        base.apply(&delta)
    }

    #[test]
    fn sole_marker_preserves_number_type() {
        let ctx = ctx_with("id", json!(42));
        let rendered = render_value(&json!("{{id}}"), &ctx).unwrap();
        assert_eq!(rendered, json!(42));
    }

    #[test]
    fn embedded_marker_is_stringified() {
        let ctx = ctx_with("id", json!(42));
        let rendered = render("/b?id={{id}}", &ctx).unwrap();
        assert_eq!(rendered, "/b?id=42");
    }

    #[test]
    fn missing_key_raises_template_missing_key() {
        let ctx = Context::initial("r", "i", "c", 0, Value::Null);
        let err = render("{{nope}}", &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateMissingKey);
        assert_eq!(err.path.as_deref(), Some("nope"));
    }

    #[test]
    fn recurses_into_nested_objects_and_arrays() {
        let ctx = ctx_with("name", json!("ana"));
        let template = json!({"user": {"name": "{{name}}"}, "tags": ["{{name}}"]});
        let rendered = render_value(&template, &ctx).unwrap();
        assert_eq!(rendered["user"]["name"], json!("ana"));
        assert_eq!(rendered["tags"][0], json!("ana"));
    }

    #[test]
    fn correlation_id_reserved_identifier_resolves() {
        let ctx = Context::initial("r", "i", "corr-xyz", 0, Value::Null);
        assert_eq!(render("{{correlation_id}}", &ctx).unwrap(), "corr-xyz");
    }
}
