//! # Assert runner (§4.4)
//!
//! Evaluates one of `status_code`, `jsonpath equals/contains`, `expression`,
//! or `schema` against the most recent Http Observation (or the Context, for
//! expressions). Produces an `AssertionResult` and an Observation whose `ok`
//! mirrors the assertion outcome — assertions never themselves retry or branch.

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::context::{Context, ContextDelta};
use crate::errors::{ErrorKind, ObservedError};
use crate::model::{AssertExpect, AssertionResult, Observation};
use crate::pathutil;
use crate::sandbox;

/// `last_http` is the most recently produced Http Observation in the flow, if any.
pub fn run(
    name: &str,
    expect: &AssertExpect,
    ctx: &Context,
    last_http: Option<&Observation>,
) -> (Observation, ContextDelta, AssertionResult) {
    let result = evaluate(expect, ctx, last_http);
    let obs = if result.passed {
        Observation::passed(name.to_string(), 0.0)
    } else {
        let err = ObservedError::new(ErrorKind::AssertionFailed, result.error.clone().unwrap_or_default())
            .with_expected_actual(result.expected.clone(), result.actual.clone());
        Observation::failed(name.to_string(), 0.0, err)
    };
    (obs, ContextDelta::new(), result)
}

fn evaluate(expect: &AssertExpect, ctx: &Context, last_http: Option<&Observation>) -> AssertionResult {
    let name = expect.name.clone().unwrap_or_else(|| "assertion".to_string());

    if let Some(expected_status) = expect.status_code {
        let actual = last_http.and_then(|o| o.status_code);
        let passed = actual == Some(expected_status);
        return AssertionResult {
            name,
            passed,
            expected: expected_status.to_string(),
            actual: actual.map(|s| s.to_string()).unwrap_or_else(|| "<no response>".to_string()),
            error: (!passed).then(|| "status code mismatch".to_string()),
        };
    }

    if let Some(path) = &expect.jsonpath {
        let body = last_http.and_then(|o| o.body.as_ref());
        let found = body.and_then(|b| pathutil::navigate_path(b, path));
        let (passed, expected_str) = match (&expect.equals, &expect.contains) {
            (Some(expected), _) => (found == Some(expected), render_value(expected)),
            (None, Some(needle)) => (
                found.map(|f| value_contains(f, needle)).unwrap_or(false),
                format!("contains {}", render_value(needle)),
            ),
            (None, None) => (found.is_some(), "<present>".to_string()),
        };
        return AssertionResult {
            name,
            passed,
            expected: expected_str,
            actual: found.map(render_value).unwrap_or_else(|| "<missing>".to_string()),
            error: (!passed).then(|| format!("jsonpath '{path}' assertion failed")),
        };
    }

    if let Some(expression) = &expect.expression {
        return match sandbox::eval_bool(expression, ctx) {
            Ok(true) => AssertionResult {
                name,
                passed: true,
                expected: "true".to_string(),
                actual: "true".to_string(),
                error: None,
            },
            Ok(false) => AssertionResult {
                name,
                passed: false,
                expected: "true".to_string(),
                actual: "false".to_string(),
                error: Some(format!("expression '{expression}' evaluated to false")),
            },
            Err(e) => AssertionResult {
                name,
                passed: false,
                expected: "true".to_string(),
                actual: "<error>".to_string(),
                error: Some(e.message),
            },
        };
    }

    if let Some(schema) = &expect.schema {
        let body = last_http.and_then(|o| o.body.as_ref()).cloned().unwrap_or(Value::Null);
        let passed = match JSONSchema::compile(schema) {
            Ok(compiled) => compiled.is_valid(&body),
            Err(_) => false,
        };
        return AssertionResult {
            name,
            passed,
            expected: "<matches schema>".to_string(),
            actual: render_value(&body),
            error: (!passed).then(|| "response body does not match schema".to_string()),
        };
    }

    AssertionResult {
        name,
        passed: false,
        expected: "<one of status_code/jsonpath/expression/schema>".to_string(),
        actual: "<none provided>".to_string(),
        error: Some("assertion has no recognizable expectation".to_string()),
    }
}

fn value_contains(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), _) => items.contains(needle),
        _ => false,
    }
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
