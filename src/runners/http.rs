//! # Http runner (§4.4)
//!
//! Renders `method`, `path`, `headers`, `query`, `body` from the Context,
//! resolves the base URL from `sut.services[step.service]`, merges headers in
//! SUT-default → service → action order, and issues the request with a
//! per-attempt deadline shortened by any turbulence-forced timeout. Turbulence
//! wraps this call site (§9): it sleeps the injected latency before sending,
//! then re-issues the request `retry_storm_count` additional times on top of
//! whatever the step's own retry policy does for failures — the two layers
//! are independent, per the precedence decision recorded in DESIGN.md.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::Value;

use crate::context::{Context, ContextDelta};
use crate::errors::{ErrorKind, ObservedError};
use crate::extractors;
use crate::model::{HttpStep, Observation, SutConfig};
use crate::retry::run_with_retry;
use crate::runners::merge_headers;
use crate::templating;
use crate::turbulence::{self, TurbulenceConfig, TurbulenceDecision};

struct AttemptOutcome {
    status_code: u16,
    headers: HashMap<String, String>,
    body: Value,
    delta: ContextDelta,
    errors: Vec<ObservedError>,
    turbulence: Option<TurbulenceDecision>,
}

pub async fn run(
    step: &HttpStep,
    ctx: &Context,
    sut: &SutConfig,
    client: &Client,
    turbulence_config: Option<&TurbulenceConfig>,
    run_seed: u64,
    instance_id: &str,
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

    let (result, attempts) = run_with_retry(step.retry.as_ref(), |attempt_index| async move {
        let decision = turbulence_config.and_then(|cfg| {
            turbulence::decide(cfg, run_seed, instance_id, &step.service, &step.name, attempt_index)
        });

        if let Some(latency) = decision.as_ref().and_then(|d| d.latency) {
            tokio::time::sleep(latency).await;
        }

        let deadline = turbulence::effective_deadline(service.timeout(), decision.as_ref());
        let repeats = decision.as_ref().map(|d| d.retry_storm_count).unwrap_or(0);

        let started = Instant::now();
        let mut last = send_once(step, ctx, sut, service, client, deadline).await;
        for _ in 0..repeats {
            last = send_once(step, ctx, sut, service, client, deadline).await;
        }
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Ok(outcome) = &mut last {
            outcome.turbulence = decision;
        }

        match last {
            Ok(outcome) if outcome.errors.is_empty() => {
                (Ok(outcome), latency_ms, None)
            }
            Ok(outcome) => {
                let status = outcome.status_code;
                let first_error = outcome.errors[0].clone();
                (Err(first_error), latency_ms, Some(status))
            }
            Err(e) => (Err(e), latency_ms, None),
        }
    })
    .await;

    match result {
        Ok(outcome) => {
            let mut obs = Observation::passed(step.name.clone(), attempts.last().map(|a| a.latency_ms).unwrap_or(0.0));
            obs.status_code = Some(outcome.status_code);
            obs.headers = Some(outcome.headers);
            obs.body = Some(outcome.body);
            obs.attempts = attempts;
            obs.turbulence = outcome.turbulence.as_ref().map(TurbulenceDecision::as_meta);
            (obs, outcome.delta)
        }
        Err(err) => {
            let latency_ms = attempts.last().map(|a| a.latency_ms).unwrap_or(0.0);
            let status_code = attempts.last().and_then(|a| a.status_code);
            let mut obs = Observation::failed(step.name.clone(), latency_ms, err);
            obs.status_code = status_code;
            obs.attempts = attempts;
            (obs, ContextDelta::new())
        }
    }
}

async fn send_once(
    step: &HttpStep,
    ctx: &Context,
    sut: &SutConfig,
    service: &crate::model::Service,
    client: &Client,
    deadline: Duration,
) -> Result<AttemptOutcome, ObservedError> {
    let rendered_path = templating::render(&step.path, ctx)?;

    let mut url = if rendered_path.starts_with("http") {
        rendered_path
    } else {
        format!("{}{}", service.base_url.trim_end_matches('/'), rendered_path)
    };

    if !step.query.is_empty() {
        let mut parts = Vec::with_capacity(step.query.len());
        for (k, v) in &step.query {
            let rendered = templating::render(v, ctx)?;
            parts.push(format!("{}={}", urlencoding::encode(k), urlencoding::encode(&rendered)));
        }
        let sep = if url.contains('?') { "&" } else { "?" };
        url = format!("{url}{sep}{}", parts.join("&"));
    }

    let method = Method::from_bytes(step.method.as_bytes())
        .map_err(|e| ObservedError::new(ErrorKind::Transport, format!("invalid method: {e}")))?;

    let merged_headers = merge_headers(&sut.default_headers, service, &step.headers);
    let mut builder = client.request(method, &url).timeout(deadline);
    for (k, v) in &merged_headers {
        let rendered = templating::render(v, ctx)?;
        builder = builder.header(k, rendered);
    }

    if let Some(body) = &step.body {
        let rendered = templating::render_value(body, ctx)?;
        builder = if step.form {
            builder.form(&rendered)
        } else {
            builder.json(&rendered)
        };
    }

    let response = builder.send().await.map_err(|e| classify_transport_error(&e))?;
    let status_code = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let raw_body = response.text().await.unwrap_or_default();
    let body: Value = if raw_body.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str(&raw_body) {
            Ok(v) => v,
            Err(_) => {
                return Ok(AttemptOutcome {
                    status_code,
                    headers,
                    body: Value::Null,
                    delta: ContextDelta::new(),
                    errors: vec![ObservedError::new(ErrorKind::BodyDecode, "response body is not valid JSON")],
                    turbulence: None,
                });
            }
        }
    };

    let (delta, extraction_errors) = extractors::extract_all(&step.extract, Some(&body));

    let mut errors = Vec::new();
    if status_code >= 400 {
        errors.push(ObservedError::new(
            ErrorKind::Status,
            format!("response status {status_code} indicates failure"),
        ));
    }
    errors.extend(extraction_errors);

    Ok(AttemptOutcome {
        status_code,
        headers,
        body,
        delta,
        errors,
        turbulence: None,
    })
}

fn classify_transport_error(err: &reqwest::Error) -> ObservedError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        let msg = err.to_string().to_lowercase();
        if msg.contains("dns") || msg.contains("resolve") {
            ErrorKind::Dns
        } else if msg.contains("tls") || msg.contains("certificate") {
            ErrorKind::Tls
        } else {
            ErrorKind::Connect
        }
    } else {
        ErrorKind::Transport
    };
    ObservedError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RetryPolicy, RetryStrategy, Service};
    use std::collections::HashMap as Map;

    fn sut_with(service_name: &str, base_url: &str) -> SutConfig {
        let mut services = Map::new();
        services.insert(
            service_name.to_string(),
            Service {
                base_url: base_url.to_string(),
                timeout_seconds: Some(1.0),
                headers: Map::new(),
            },
        );
        SutConfig {
            name: "test-sut".into(),
            services,
            default_headers: Map::new(),
            turbulence: None,
        }
    }

    #[tokio::test]
    async fn missing_service_produces_missing_service_error() {
        let step = HttpStep {
            name: "get_a".into(),
            service: "nope".into(),
            method: "GET".into(),
            path: "/a".into(),
            headers: Map::new(),
            query: Map::new(),
            body: None,
            form: false,
            extract: Map::new(),
            retry: None,
        };
        let sut = sut_with("payments", "http://localhost:1");
        let ctx = Context::new();
        let client = Client::new();

        let (obs, _delta) = run(&step, &ctx, &sut, &client, None, 0, "inst-1").await;
        assert!(!obs.ok);
        assert_eq!(obs.errors[0].kind, ErrorKind::MissingService);
    }

    #[test]
    fn retry_policy_shape_is_recognized() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            attempts: 3,
            delay_ms: 10,
            factor: None,
            cap_ms: None,
        };
        assert_eq!(policy.attempts, 3);
    }
}
