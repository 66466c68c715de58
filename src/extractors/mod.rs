//! # Extraction (§4.2)
//!
//! Pulls values out of an Http response body to populate the next Context. Each
//! `extract` entry in an `HttpStep` maps a target name to a dotted/indexed path
//! into the JSON body (`data.token`, `items[0].id`). There is no `[*]` wildcard
//! and no `regex:` mode here — the specification scopes extraction to plain
//! path navigation; a path that resolves to `null` is treated the same as a
//! path that does not exist, since a runner cannot tell the two apart from the
//! caller's point of view.

use std::collections::HashMap;

use serde_json::Value;

use crate::context::ContextDelta;
use crate::errors::{ErrorKind, ObservedError};
use crate::pathutil;

/// Resolves every `extract` rule against a response body, returning a delta of
/// the values that resolved and an error for each target that did not.
pub fn extract_all(
    rules: &HashMap<String, String>,
    body: Option<&Value>,
) -> (ContextDelta, Vec<ObservedError>) {
    let mut delta = ContextDelta::new();
    let mut errors = Vec::new();

    for (target, path) in rules {
        match extract_one(path, body) {
            Some(value) => delta.insert(target.clone(), value),
            None => errors.push(
                ObservedError::new(
                    ErrorKind::ExtractionMissingPath,
                    format!("path '{path}' did not resolve in the response body"),
                )
                .with_path(path.clone()),
            ),
        }
    }

    (delta, errors)
}

fn extract_one(path: &str, body: Option<&Value>) -> Option<Value> {
    let body = body?;
    let found = pathutil::navigate_path(body, path)?;
    if found.is_null() {
        None
    } else {
        Some(found.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_field() {
        let body = json!({"data": {"token": "abc123"}});
        let mut rules = HashMap::new();
        rules.insert("auth_token".to_string(), "data.token".to_string());

        let (delta, errors) = extract_all(&rules, Some(&body));
        assert!(errors.is_empty());
        assert!(!delta.is_empty());
    }

    #[test]
    fn missing_path_produces_extraction_missing_path_error() {
        let body = json!({"data": {}});
        let mut rules = HashMap::new();
        rules.insert("token".to_string(), "data.missing".to_string());

        let (delta, errors) = extract_all(&rules, Some(&body));
        assert!(delta.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::ExtractionMissingPath);
    }

    #[test]
    fn null_value_is_treated_as_missing() {
        let body = json!({"token": null});
        let mut rules = HashMap::new();
        rules.insert("token".to_string(), "token".to_string());

        let (delta, errors) = extract_all(&rules, Some(&body));
        assert!(delta.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn indexed_path_into_array() {
        let body = json!({"items": [{"id": 7}]});
        let mut rules = HashMap::new();
        rules.insert("first_id".to_string(), "items[0].id".to_string());

        let (delta, errors) = extract_all(&rules, Some(&body));
        assert!(errors.is_empty());
        assert!(!delta.is_empty());
    }

    #[test]
    fn absent_body_fails_every_rule() {
        let mut rules = HashMap::new();
        rules.insert("x".to_string(), "a.b".to_string());
        let (delta, errors) = extract_all(&rules, None);
        assert!(delta.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
