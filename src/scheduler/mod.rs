//! # Instance scheduler (§4.7)
//!
//! Bounded-parallel driver: dispatches `N` instances in deterministic order
//! `0..N`, holding at most `P` in flight via a semaphore. Cooperative
//! cancellation stops new dispatch immediately, gives already-running
//! instances a grace period to finish on their own, then forcefully aborts
//! whatever remains and records those as `cancelled`. Never buffers every
//! instance in memory at once — only the bounded `samples` map used to
//! compute the final percentiles survives the run.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};

use crate::errors::ObservedError;
use crate::model::{AssertionResult, InstanceRecord, InstanceStatus, LatencyPercentiles, Observation, RunSummary, Scenario, Step, SutConfig};
use crate::scenario_runner::{self, EventSink, InstanceInput};
use crate::turbulence::TurbulenceConfig;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A cheap, cloneable handle used to request cancellation of an in-flight run
/// and to let the dispatch loop and the grace-period watcher observe it.
#[derive(Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called; resolves immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

pub struct ExecuteInput<'a> {
    pub run_id: &'a str,
    pub scenario: &'a Scenario,
    pub sut: &'a SutConfig,
    pub n: usize,
    pub p: usize,
    pub seed: u64,
    pub turbulence: Option<TurbulenceConfig>,
    pub cancel: CancelSignal,
}

pub async fn execute(input: ExecuteInput<'_>, client: Client, sink: Arc<dyn EventSink>) -> RunSummary {
    let stats = Arc::new(StatsCollectingSink::new(sink, input.scenario));
    let semaphore = Arc::new(Semaphore::new(input.p.max(1)));
    let scenario = Arc::new(input.scenario.clone());
    let sut = Arc::new(input.sut.clone());
    let turbulence = input.turbulence.map(Arc::new);

    let started = Instant::now();
    let mut handles = Vec::with_capacity(input.n);

    for index in 0..input.n {
        if input.cancel.is_cancelled() {
            break;
        }
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        if input.cancel.is_cancelled() {
            drop(permit);
            break;
        }
        let correlation_id = derive_correlation_id(input.run_id, index);
        let instance_id = format!("{}-{:06}", input.run_id, index);
        let seed_prefix = input.seed.wrapping_add(index as u64);
        let entry_seed_data = scenario
            .entry
            .as_ref()
            .map(|e| e.seed_data.clone())
            .unwrap_or(Value::Null);

        let scenario = scenario.clone();
        let sut = sut.clone();
        let client = client.clone();
        let turbulence = turbulence.clone();
        let stats = stats.clone();
        let run_id = input.run_id.to_string();
        let instance_id_for_record = instance_id.clone();
        let instance_cancel = input.cancel.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            scenario_runner::run_instance(
                InstanceInput {
                    scenario: &scenario,
                    sut: &sut,
                    run_id: &run_id,
                    instance_id: &instance_id,
                    correlation_id: &correlation_id,
                    seed_prefix,
                    entry_seed_data,
                    run_seed: input.seed,
                    client: &client,
                    turbulence: turbulence.as_deref(),
                    cancel: Some(instance_cancel),
                },
                stats.as_ref(),
            )
            .await
        });
        handles.push((instance_id_for_record, handle));
    }

    let abort_handles: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();
    let grace_cancel = input.cancel.clone();
    let watcher = tokio::spawn(async move {
        grace_cancel.cancelled().await;
        tokio::time::sleep(DEFAULT_GRACE_PERIOD).await;
        for ah in &abort_handles {
            ah.abort();
        }
    });

    let mut records = Vec::with_capacity(handles.len());
    for (instance_id, handle) in handles {
        let record = match handle.await {
            Ok(record) => record,
            Err(_aborted) => cancelled_record(input.run_id, &instance_id),
        };
        stats.on_instance_complete(&record).await;
        records.push(record);
    }
    watcher.abort();

    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    summarize(input.run_id, &records, duration_ms, &stats)
}

fn cancelled_record(run_id: &str, instance_id: &str) -> InstanceRecord {
    let now = chrono::Utc::now();
    InstanceRecord {
        run_id: run_id.to_string(),
        instance_id: instance_id.to_string(),
        correlation_id: String::new(),
        scenario_id: String::new(),
        seed_prefix: 0,
        entry: Value::Null,
        status: InstanceStatus::Errored,
        started_at: now,
        completed_at: Some(now),
        error: Some(crate::errors::ErrorKind::Cancelled.as_str().to_string()),
        steps_executed: 0,
    }
}

fn derive_correlation_id(run_id: &str, index: usize) -> String {
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    index.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn summarize(run_id: &str, records: &[InstanceRecord], duration_ms: f64, stats: &StatsCollectingSink) -> RunSummary {
    let total = records.len();
    let passed = records.iter().filter(|r| r.status == InstanceStatus::Passed).count();
    let failed = records.iter().filter(|r| r.status == InstanceStatus::Failed).count();
    let errored = records.iter().filter(|r| r.status == InstanceStatus::Errored).count();
    let pass_rate = if total == 0 { 0.0 } else { passed as f64 / total as f64 };

    RunSummary {
        run_id: run_id.to_string(),
        total,
        passed,
        failed,
        errored,
        pass_rate,
        duration_ms,
        latency_by_action: stats.percentiles_by_prefix("action:"),
        latency_by_service: stats.percentiles_by_prefix("service:"),
    }
}

/// Wraps the caller's `EventSink` (typically the artifact store) and also
/// accumulates latency samples so `execute` can compute p50/p95/p99 without
/// the store needing to know about percentiles.
struct StatsCollectingSink {
    inner: Arc<dyn EventSink>,
    step_services: HashMap<String, String>,
    samples: Mutex<HashMap<String, Vec<f64>>>,
}

impl StatsCollectingSink {
    fn new(inner: Arc<dyn EventSink>, scenario: &Scenario) -> Self {
        let mut step_services = HashMap::new();
        collect_step_services(&scenario.flow, &mut step_services);
        Self {
            inner,
            step_services,
            samples: Mutex::new(HashMap::new()),
        }
    }

    fn percentiles_by_prefix(&self, prefix: &str) -> HashMap<String, LatencyPercentiles> {
        let samples = self.samples.lock().expect("stats mutex poisoned");
        samples
            .iter()
            .filter_map(|(key, values)| {
                key.strip_prefix(prefix).map(|name| {
                    let mut sorted = values.clone();
                    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    (
                        name.to_string(),
                        LatencyPercentiles {
                            p50: percentile(&sorted, 0.50),
                            p95: percentile(&sorted, 0.95),
                            p99: percentile(&sorted, 0.99),
                        },
                    )
                })
            })
            .collect()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn collect_step_services(steps: &[Step], out: &mut HashMap<String, String>) {
    for step in steps {
        match step {
            Step::Http(s) => {
                out.insert(s.name.clone(), s.service.clone());
            }
            Step::Wait(s) => {
                out.insert(s.name.clone(), s.service.clone());
            }
            Step::Assert(_) => {}
            Step::Branch(b) => {
                collect_step_services(&b.if_true, out);
                collect_step_services(&b.if_false, out);
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSink for StatsCollectingSink {
    async fn on_step(
        &self,
        instance_id: &str,
        step_name: &str,
        observation: &Observation,
    ) -> Result<(), ObservedError> {
        {
            let mut samples = self.samples.lock().expect("stats mutex poisoned");
            samples
                .entry(format!("action:{step_name}"))
                .or_default()
                .push(observation.latency_ms);
            if let Some(service) = self.step_services.get(step_name) {
                samples
                    .entry(format!("service:{service}"))
                    .or_default()
                    .push(observation.latency_ms);
            }
        }
        self.inner.on_step(instance_id, step_name, observation).await
    }

    async fn on_assertion(&self, instance_id: &str, result: &AssertionResult) -> Result<(), ObservedError> {
        self.inner.on_assertion(instance_id, result).await
    }

    async fn on_instance_complete(&self, record: &InstanceRecord) {
        self.inner.on_instance_complete(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssertExpect, AssertStep, Service, StopWhen};
    use crate::scenario_runner::NullSink;
    use std::collections::HashMap as Map;

    fn scenario() -> Scenario {
        Scenario {
            id: "s1".into(),
            description: None,
            entry: None,
            flow: vec![Step::Assert(AssertStep {
                name: "always_true".into(),
                expect: AssertExpect { expression: Some("1 == 1".into()), ..Default::default() },
            })],
            assertions: vec![],
            stop_when: StopWhen::default(),
            max_steps: 10,
        }
    }

    fn sut() -> SutConfig {
        SutConfig { name: "sut".into(), services: Map::new(), default_headers: Map::new(), turbulence: None }
    }

    #[test]
    fn cancel_signal_starts_uncancelled() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn percentile_of_empty_slice_is_zero() {
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn percentile_picks_middle_of_sorted_samples() {
        let samples = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&samples, 0.50), 30.0);
        assert_eq!(percentile(&samples, 0.0), 10.0);
        assert_eq!(percentile(&samples, 1.0), 50.0);
    }

    #[tokio::test]
    async fn dispatches_all_instances_and_computes_pass_rate() {
        let scenario = scenario();
        let sut = sut();
        let client = Client::new();

        let summary = execute(
            ExecuteInput {
                run_id: "run-1",
                scenario: &scenario,
                sut: &sut,
                n: 5,
                p: 2,
                seed: 1,
                turbulence: None,
                cancel: CancelSignal::new(),
            },
            client,
            Arc::new(NullSink),
        )
        .await;

        assert_eq!(summary.total, 5);
        assert_eq!(summary.passed, 5);
        assert_eq!(summary.pass_rate, 1.0);
    }

    #[tokio::test]
    async fn already_cancelled_signal_dispatches_nothing() {
        let scenario = scenario();
        let sut = sut();
        let client = Client::new();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let summary = execute(
            ExecuteInput {
                run_id: "run-1",
                scenario: &scenario,
                sut: &sut,
                n: 5,
                p: 2,
                seed: 1,
                turbulence: None,
                cancel,
            },
            client,
            Arc::new(NullSink),
        )
        .await;

        assert_eq!(summary.total, 0);
    }
}
