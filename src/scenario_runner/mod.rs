//! # Scenario runner (§4.6)
//!
//! Owns one Instance: builds its initial Context, walks the flow depth-first
//! (branches push their chosen sub-flow onto an explicit stack rather than
//! recursing — steps_executed is checked once per iteration regardless of
//! nesting depth), invokes the appropriate action runner for each Step,
//! applies the returned ContextDelta, and evaluates `stop_when` between
//! steps. After the flow — even one stopped early by `any_action_fails` —
//! scenario-level assertions still run (§9's decision: assertion evaluation is
//! independent of the action-failure stop policy).
//!
//! A run-level `CancelSignal`, when given, is checked between every step (and
//! inside `runners::wait`'s internal poll loop, the one suspension point
//! within a single step) so cancellation produces a clean `cancelled`
//! completion instead of tearing an in-flight store append. A store-write
//! failure that survives `store`'s bounded retry is tracked the same way and
//! takes priority over a plain failed/passed outcome, per the invariant that
//! every instance gets exactly one completion record.

use chrono::Utc;
use reqwest::Client;

use crate::context::Context;
use crate::errors::{ErrorKind, ObservedError};
use crate::model::{AssertionResult, InstanceRecord, InstanceStatus, Observation, Scenario, Step, SutConfig};
use crate::runners;
use crate::scheduler::CancelSignal;
use crate::turbulence::TurbulenceConfig;

/// Sink the scenario runner pushes every Step/Assertion event to as it
/// executes, so the artifact store can persist them without the runner
/// needing to know about files or sequencing. `on_step`/`on_assertion` report
/// back whether the underlying write landed — `run_instance` folds a failure
/// here into the instance's terminal status rather than discarding it.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn on_step(&self, instance_id: &str, step_name: &str, observation: &Observation) -> Result<(), ObservedError>;
    async fn on_assertion(&self, instance_id: &str, result: &AssertionResult) -> Result<(), ObservedError>;
    /// Called once by the scheduler after an instance reaches its terminal
    /// status — not by the scenario runner itself, since `run_instance`
    /// returns the record synchronously to its caller.
    async fn on_instance_complete(&self, record: &InstanceRecord);
}

/// An `EventSink` that drops everything — useful for replay and for tests
/// that only care about the final `InstanceRecord`.
pub struct NullSink;

#[async_trait::async_trait]
impl EventSink for NullSink {
    async fn on_step(&self, _instance_id: &str, _step_name: &str, _observation: &Observation) -> Result<(), ObservedError> {
        Ok(())
    }
    async fn on_assertion(&self, _instance_id: &str, _result: &AssertionResult) -> Result<(), ObservedError> {
        Ok(())
    }
    async fn on_instance_complete(&self, _record: &InstanceRecord) {}
}

pub struct InstanceInput<'a> {
    pub scenario: &'a Scenario,
    pub sut: &'a SutConfig,
    pub run_id: &'a str,
    pub instance_id: &'a str,
    pub correlation_id: &'a str,
    pub seed_prefix: u64,
    pub entry_seed_data: serde_json::Value,
    pub run_seed: u64,
    pub client: &'a Client,
    pub turbulence: Option<&'a TurbulenceConfig>,
    pub cancel: Option<CancelSignal>,
}

pub async fn run_instance(input: InstanceInput<'_>, sink: &dyn EventSink) -> InstanceRecord {
    let started_at = Utc::now();

    let mut ctx = Context::initial(
        input.run_id,
        input.instance_id,
        input.correlation_id,
        0,
        input.entry_seed_data.clone(),
    );

    let mut steps_executed = 0usize;
    let mut max_steps_exceeded = false;
    let mut any_observation_failed = false;
    let mut cancelled = false;
    let mut store_write_failed = false;
    let mut last_http: Option<Observation> = None;

    let mut stack: Vec<std::slice::Iter<Step>> = vec![input.scenario.flow.iter()];

    'walk: while let Some(frame) = stack.last_mut() {
        if is_cancelled(input.cancel.as_ref()) {
            cancelled = true;
            break 'walk;
        }

        let step = match frame.next() {
            Some(step) => step,
            None => {
                stack.pop();
                continue;
            }
        };

        if steps_executed >= input.scenario.max_steps {
            max_steps_exceeded = true;
            break 'walk;
        }
        steps_executed += 1;

        let ok = match step {
            Step::Http(s) => {
                let (obs, delta) = runners::http::run(
                    s,
                    &ctx,
                    input.sut,
                    input.client,
                    input.turbulence,
                    input.run_seed,
                    input.instance_id,
                )
                .await;
                let ok = obs.ok;
                if sink.on_step(input.instance_id, &s.name, &obs).await.is_err() {
                    store_write_failed = true;
                }
                last_http = Some(obs);
                ctx = ctx.apply(&delta);
                ok
            }
            Step::Wait(s) => {
                let (obs, delta) = runners::wait::run(s, &ctx, input.sut, input.client, input.cancel.as_ref()).await;
                let ok = obs.ok;
                if is_cancelled_observation(&obs) {
                    cancelled = true;
                }
                if sink.on_step(input.instance_id, &s.name, &obs).await.is_err() {
                    store_write_failed = true;
                }
                ctx = ctx.apply(&delta);
                ok
            }
            Step::Assert(s) => {
                let (obs, delta, result) = runners::assert::run(&s.name, &s.expect, &ctx, last_http.as_ref());
                let ok = obs.ok;
                if sink.on_step(input.instance_id, &s.name, &obs).await.is_err() {
                    store_write_failed = true;
                }
                if sink.on_assertion(input.instance_id, &result).await.is_err() {
                    store_write_failed = true;
                }
                ctx = ctx.apply(&delta);
                ok
            }
            Step::Branch(s) => {
                let decision = runners::branch::decide(&s.name, &s.condition, &ctx);
                let ok = decision.observation.ok;
                if sink.on_step(input.instance_id, &s.name, &decision.observation).await.is_err() {
                    store_write_failed = true;
                }
                if ok {
                    let sub_flow = if decision.took_true { &s.if_true } else { &s.if_false };
                    stack.push(sub_flow.iter());
                }
                ok
            }
        };

        if cancelled {
            break 'walk;
        }

        if !ok {
            any_observation_failed = true;
            if input.scenario.stop_when.any_action_fails {
                break 'walk;
            }
        }
    }

    let mut any_assertion_failed = false;
    if !max_steps_exceeded && !cancelled {
        for expect in &input.scenario.assertions {
            if is_cancelled(input.cancel.as_ref()) {
                cancelled = true;
                break;
            }
            let (obs, _delta, result) = runners::assert::run(
                expect.name.as_deref().unwrap_or("assertion"),
                expect,
                &ctx,
                last_http.as_ref(),
            );
            if sink.on_step(input.instance_id, &obs.step_name, &obs).await.is_err() {
                store_write_failed = true;
            }
            if sink.on_assertion(input.instance_id, &result).await.is_err() {
                store_write_failed = true;
            }
            if !result.passed {
                any_assertion_failed = true;
            }
        }
    }

    let completed_at = Utc::now();
    let (status, error) = if cancelled {
        (InstanceStatus::Errored, Some(ErrorKind::Cancelled.as_str().to_string()))
    } else if store_write_failed {
        (InstanceStatus::Errored, Some(ErrorKind::StoreWrite.as_str().to_string()))
    } else if max_steps_exceeded {
        (InstanceStatus::Errored, Some(ErrorKind::MaxStepsExceeded.as_str().to_string()))
    } else if any_observation_failed || any_assertion_failed {
        (InstanceStatus::Failed, None)
    } else {
        (InstanceStatus::Passed, None)
    };

    InstanceRecord {
        run_id: input.run_id.to_string(),
        instance_id: input.instance_id.to_string(),
        correlation_id: input.correlation_id.to_string(),
        scenario_id: input.scenario.id.clone(),
        seed_prefix: input.seed_prefix,
        entry: input.entry_seed_data,
        status,
        started_at,
        completed_at: Some(completed_at),
        error,
        steps_executed,
    }
}

fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.map(CancelSignal::is_cancelled).unwrap_or(false)
}

/// A `Wait` runner can itself observe cancellation mid-poll and must report a
/// clean `cancelled` outcome for that step; detect it by its error kind so
/// `run_instance` short-circuits the walk instead of treating it as a plain
/// failed step.
fn is_cancelled_observation(obs: &Observation) -> bool {
    obs.errors.iter().any(|e| e.kind == ErrorKind::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssertExpect, AssertStep, Service, StopWhen};
    use serde_json::json;
    use std::collections::HashMap;

    fn sut() -> SutConfig {
        let mut services = HashMap::new();
        services.insert(
            "payments".to_string(),
            Service { base_url: "http://localhost:1".to_string(), timeout_seconds: Some(0.01), headers: HashMap::new() },
        );
        SutConfig { name: "sut".into(), services, default_headers: HashMap::new(), turbulence: None }
    }

    fn scenario_with(flow: Vec<Step>, assertions: Vec<AssertExpect>) -> Scenario {
        Scenario {
            id: "s1".into(),
            description: None,
            entry: None,
            flow,
            assertions,
            stop_when: StopWhen::default(),
            max_steps: 100,
        }
    }

    #[tokio::test]
    async fn instance_passes_when_every_step_and_assertion_pass() {
        let flow = vec![Step::Assert(AssertStep {
            name: "trivially_true".into(),
            expect: AssertExpect { expression: Some("1 == 1".into()), ..Default::default() },
        })];
        let scenario = scenario_with(flow, vec![]);
        let sut = sut();
        let client = Client::new();

        let record = run_instance(
            InstanceInput {
                scenario: &scenario,
                sut: &sut,
                run_id: "run-1",
                instance_id: "inst-1",
                correlation_id: "corr-1",
                seed_prefix: 0,
                entry_seed_data: json!({}),
                run_seed: 1,
                client: &client,
                turbulence: None,
                cancel: None,
            },
            &NullSink,
        )
        .await;

        assert_eq!(record.status, InstanceStatus::Passed);
    }

    #[tokio::test]
    async fn failing_assertion_marks_instance_failed_not_errored() {
        let flow = vec![Step::Assert(AssertStep {
            name: "always_false".into(),
            expect: AssertExpect { expression: Some("1 == 2".into()), ..Default::default() },
        })];
        let scenario = scenario_with(flow, vec![]);
        let sut = sut();
        let client = Client::new();

        let record = run_instance(
            InstanceInput {
                scenario: &scenario,
                sut: &sut,
                run_id: "run-1",
                instance_id: "inst-1",
                correlation_id: "corr-1",
                seed_prefix: 0,
                entry_seed_data: json!({}),
                run_seed: 1,
                client: &client,
                turbulence: None,
                cancel: None,
            },
            &NullSink,
        )
        .await;

        assert_eq!(record.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn max_steps_zero_marks_instance_errored() {
        let flow = vec![Step::Assert(AssertStep {
            name: "never_runs".into(),
            expect: AssertExpect { expression: Some("true".into()), ..Default::default() },
        })];
        let mut scenario = scenario_with(flow, vec![]);
        scenario.max_steps = 0;
        let sut = sut();
        let client = Client::new();

        let record = run_instance(
            InstanceInput {
                scenario: &scenario,
                sut: &sut,
                run_id: "run-1",
                instance_id: "inst-1",
                correlation_id: "corr-1",
                seed_prefix: 0,
                entry_seed_data: json!({}),
                run_seed: 1,
                client: &client,
                turbulence: None,
                cancel: None,
            },
            &NullSink,
        )
        .await;

        assert_eq!(record.status, InstanceStatus::Errored);
        assert_eq!(record.error.as_deref(), Some("max_steps_exceeded"));
    }

    #[tokio::test]
    async fn branch_sub_flow_steps_count_toward_steps_executed() {
        use crate::model::BranchStep;
        let flow = vec![Step::Branch(BranchStep {
            name: "route".into(),
            condition: "true".into(),
            if_true: vec![Step::Assert(AssertStep {
                name: "inner".into(),
                expect: AssertExpect { expression: Some("true".into()), ..Default::default() },
            })],
            if_false: vec![],
        })];
        let scenario = scenario_with(flow, vec![]);
        let sut = sut();
        let client = Client::new();

        let record = run_instance(
            InstanceInput {
                scenario: &scenario,
                sut: &sut,
                run_id: "run-1",
                instance_id: "inst-1",
                correlation_id: "corr-1",
                seed_prefix: 0,
                entry_seed_data: json!({}),
                run_seed: 1,
                client: &client,
                turbulence: None,
                cancel: None,
            },
            &NullSink,
        )
        .await;

        assert_eq!(record.steps_executed, 2);
        assert_eq!(record.status, InstanceStatus::Passed);
    }
}
