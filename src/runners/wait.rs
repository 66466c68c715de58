//! # Wait runner (§4.4)
//!
//! Renders request inputs once, then polls the endpoint at `interval_seconds`
//! until the `expect` predicate holds or `timeout_seconds` elapses. The first
//! poll executes immediately — no pre-sleep — matching the "poll now, sleep
//! only between attempts" contract. Every poll is recorded as an attempt.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;

use crate::context::{Context, ContextDelta};
use crate::errors::{ErrorKind, ObservedError};
use crate::model::{AttemptRecord, Observation, SutConfig, WaitExpect, WaitStep};
use crate::pathutil;
use crate::sandbox;
use crate::scheduler::CancelSignal;
use crate::templating;

pub async fn run(
    step: &WaitStep,
    ctx: &Context,
    sut: &SutConfig,
    client: &Client,
    cancel: Option<&CancelSignal>,
) -> (Observation, ContextDelta) {
    let service = match sut.services.get(&step.service) {
        Some(s) => s,
        None => {
            let err = ObservedError::new(
                ErrorKind::MissingService,
                format!("service '{}' is not declared in the SUT", step.service),
            );
            return (Observation::failed(step.name.clone(), 0.0, err), ContextDelta::new());
        }
    };

    let rendered_path = match templating::render(&step.path, ctx) {
        Ok(p) => p,
        Err(e) => return (Observation::failed(step.name.clone(), 0.0, e), ContextDelta::new()),
    };
    let url = if rendered_path.starts_with("http") {
        rendered_path
    } else {
        format!("{}{}", service.base_url.trim_end_matches('/'), rendered_path)
    };

    let started = Instant::now();
    let timeout = Duration::from_secs_f64(step.timeout_seconds);
    let interval = Duration::from_secs_f64(step.interval_seconds);

    let mut attempts = Vec::new();
    let mut attempt_index = 0u32;

    loop {
        if cancel.map(CancelSignal::is_cancelled).unwrap_or(false) {
            let err = ObservedError::new(ErrorKind::Cancelled, "run was cancelled while waiting");
            let mut obs = Observation::failed(step.name.clone(), 0.0, err);
            obs.attempts = attempts;
            return (obs, ContextDelta::new());
        }

        let poll_started = Instant::now();
        let result = client.get(&url).send().await;
        let latency_ms = poll_started.elapsed().as_secs_f64() * 1000.0;

        let body = match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                attempts.push(AttemptRecord {
                    attempt_index,
                    ok: true,
                    latency_ms,
                    status_code: Some(status),
                    error: None,
                });
                Some(parsed)
            }
            Err(e) => {
                attempts.push(AttemptRecord {
                    attempt_index,
                    ok: false,
                    latency_ms,
                    status_code: None,
                    error: Some(ObservedError::new(ErrorKind::Transport, e.to_string())),
                });
                None
            }
        };

        if let Some(body) = &body {
            if predicate_holds(&step.expect, body, ctx) {
                let mut obs = Observation::passed(step.name.clone(), latency_ms);
                obs.body = Some(body.clone());
                obs.attempts = attempts;
                return (obs, ContextDelta::new());
            }
        }

        if started.elapsed() + interval >= timeout {
            let err = ObservedError::new(
                ErrorKind::WaitTimeout,
                format!("condition did not hold within {} attempts", attempts.len()),
            );
            let mut obs = Observation::failed(step.name.clone(), latency_ms, err);
            obs.attempts = attempts;
            return (obs, ContextDelta::new());
        }

        tokio::time::sleep(interval).await;
        attempt_index += 1;
    }
}

fn predicate_holds(expect: &WaitExpect, body: &Value, ctx: &Context) -> bool {
    match expect {
        WaitExpect::JsonPath { jsonpath, equals, contains } => {
            let found = pathutil::navigate_path(body, jsonpath);
            match (found, equals, contains) {
                (Some(actual), Some(expected), _) => actual == expected,
                (Some(actual), None, Some(needle)) => value_contains(actual, needle),
                _ => false,
            }
        }
        WaitExpect::Expression { expression } => sandbox::eval_bool(expression, ctx).unwrap_or(false),
    }
}

fn value_contains(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), _) => items.contains(needle),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jsonpath_equals_matches_exact_value() {
        let ctx = Context::new();
        let body = json!({"status": "done"});
        let expect = WaitExpect::JsonPath {
            jsonpath: "status".to_string(),
            equals: Some(json!("done")),
            contains: None,
        };
        assert!(predicate_holds(&expect, &body, &ctx));
    }

    #[test]
    fn jsonpath_equals_rejects_mismatch() {
        let ctx = Context::new();
        let body = json!({"status": "pending"});
        let expect = WaitExpect::JsonPath {
            jsonpath: "status".to_string(),
            equals: Some(json!("done")),
            contains: None,
        };
        assert!(!predicate_holds(&expect, &body, &ctx));
    }

    #[test]
    fn jsonpath_contains_checks_substring() {
        let ctx = Context::new();
        let body = json!({"message": "order is ready for pickup"});
        let expect = WaitExpect::JsonPath {
            jsonpath: "message".to_string(),
            equals: None,
            contains: Some(json!("ready")),
        };
        assert!(predicate_holds(&expect, &body, &ctx));
    }

    #[test]
    fn expression_predicate_is_evaluated_via_sandbox() {
        let ctx = Context::new();
        let body = json!({});
        let expect = WaitExpect::Expression { expression: "1 == 1".to_string() };
        assert!(predicate_holds(&expect, &body, &ctx));
    }
}
