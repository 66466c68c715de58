//! Data model: SUTConfig, Scenario, Step, Run, Instance, Observation, AssertionResult.
//!
//! These are the entities of §3. Step is a tagged union (Http | Wait | Assert |
//! Branch) rather than the duck-typed `action: String` + `params: Value` shape
//! used by earlier versions of this runner — validation rejects unknown keys and
//! the runner dispatches on the tag instead of a string match.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ObservedError;
use crate::turbulence::TurbulenceConfig;

// ============================================================================
// SUT
// ============================================================================

/// A named collection of HTTP services this framework exercises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SutConfig {
    pub name: String,
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
    /// Fault-injection policy for this SUT; absent means turbulence is off.
    /// The CLI's `run` invocation takes no separate turbulence flag (§6), so
    /// this is how an operator opts a run into fault injection.
    #[serde(default)]
    pub turbulence: Option<TurbulenceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub base_url: String,
    #[serde(default, rename = "timeout_seconds")]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Service {
    pub fn timeout(&self) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(30))
    }
}

// ============================================================================
// SCENARIO
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entry: Option<Entry>,
    pub flow: Vec<Step>,
    #[serde(default)]
    pub assertions: Vec<AssertExpect>,
    #[serde(default)]
    pub stop_when: StopWhen,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

pub fn default_max_steps() -> usize {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub seed_data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopWhen {
    #[serde(default)]
    pub any_action_fails: bool,
}

/// A Step, tagged by `type`. Common field `name` is accessible via `Step::name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Http(HttpStep),
    Wait(WaitStep),
    Assert(AssertStep),
    Branch(BranchStep),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Http(s) => &s.name,
            Step::Wait(s) => &s.name,
            Step::Assert(s) => &s.name,
            Step::Branch(s) => &s.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStep {
    pub name: String,
    pub service: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// `form` declares the body should be serialized as `application/x-www-form-urlencoded`
    /// instead of JSON; irrelevant when `body` is absent.
    #[serde(default)]
    pub form: bool,
    /// target-name -> path
    #[serde(default)]
    pub extract: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub attempts: u32,
    pub delay_ms: u64,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub cap_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitStep {
    pub name: String,
    pub service: String,
    pub path: String,
    pub interval_seconds: f64,
    pub timeout_seconds: f64,
    pub expect: WaitExpect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitExpect {
    JsonPath {
        jsonpath: String,
        #[serde(default)]
        equals: Option<Value>,
        #[serde(default)]
        contains: Option<Value>,
    },
    Expression {
        expression: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertStep {
    pub name: String,
    pub expect: AssertExpect,
}

/// Shared by the post-flow `Scenario.assertions` list and the inline `Assert` step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssertExpect {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub jsonpath: Option<String>,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub contains: Option<Value>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStep {
    pub name: String,
    pub condition: String,
    pub if_true: Vec<Step>,
    #[serde(default)]
    pub if_false: Vec<Step>,
}

// ============================================================================
// RUN / INSTANCE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub seed: u64,
    pub parallelism: usize,
    pub instance_target: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Passed,
    Failed,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub run_id: String,
    pub instance_id: String,
    pub correlation_id: String,
    pub scenario_id: String,
    pub seed_prefix: u64,
    pub entry: Value,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub steps_executed: usize,
}

// ============================================================================
// OBSERVATION / ASSERTION RESULT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurbulenceMeta {
    #[serde(default)]
    pub injected_latency_ms: Option<f64>,
    #[serde(default)]
    pub forced_timeout: bool,
    #[serde(default)]
    pub retry_storm_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_index: u32,
    pub ok: bool,
    pub latency_ms: f64,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<ObservedError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub step_name: String,
    pub ok: bool,
    pub latency_ms: f64,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub errors: Vec<ObservedError>,
    #[serde(default)]
    pub turbulence: Option<TurbulenceMeta>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl Observation {
    pub fn passed(step_name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            step_name: step_name.into(),
            ok: true,
            latency_ms,
            status_code: None,
            headers: None,
            body: None,
            errors: Vec::new(),
            turbulence: None,
            attempts: Vec::new(),
        }
    }

    pub fn failed(step_name: impl Into<String>, latency_ms: f64, error: ObservedError) -> Self {
        Self {
            step_name: step_name.into(),
            ok: false,
            latency_ms,
            status_code: None,
            headers: None,
            body: None,
            errors: vec![error],
            turbulence: None,
            attempts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Computed once, at the end of a run, from the streamed step events — never
/// held in memory as a growing accumulator of raw samples beyond one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub pass_rate: f64,
    pub duration_ms: f64,
    pub latency_by_action: HashMap<String, LatencyPercentiles>,
    pub latency_by_service: HashMap<String, LatencyPercentiles>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_deserializes_by_tag() {
        let raw = json!({
            "type": "http",
            "name": "get_a",
            "service": "payments",
            "method": "GET",
            "path": "/a",
        });
        let step: Step = serde_json::from_value(raw).unwrap();
        assert_eq!(step.name(), "get_a");
        assert!(matches!(step, Step::Http(_)));
    }

    #[test]
    fn branch_step_nests_substeps() {
        let raw = json!({
            "type": "branch",
            "name": "route",
            "condition": "true",
            "if_true": [
                {"type": "assert", "name": "inner", "expect": {"status_code": 200}}
            ],
            "if_false": []
        });
        let step: Step = serde_json::from_value(raw).unwrap();
        match step {
            Step::Branch(b) => assert_eq!(b.if_true.len(), 1),
            _ => panic!("expected branch"),
        }
    }

    #[test]
    fn service_default_timeout_is_30s() {
        let svc = Service {
            base_url: "http://x".into(),
            timeout_seconds: None,
            headers: HashMap::new(),
        };
        assert_eq!(svc.timeout(), Duration::from_secs(30));
    }
}
