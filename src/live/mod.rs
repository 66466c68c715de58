//! # Live-update channel (§4.9)
//!
//! Tail-follows a run's `instances.jsonl` stream and pushes typed events to
//! one subscriber: `instance_complete` per finished instance, `stats_update`
//! rolled up and throttled to at most 10 per 100 ms window by coalescing,
//! `run_complete` once `summary.json` appears, and a `heartbeat` every 5 s of
//! otherwise-idle polling. Reconnect is just calling `tail` again with the
//! cursor the client last observed — the channel itself holds no session state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::model::{InstanceRecord, InstanceStatus, RunSummary};
use crate::store::{Stream, WriterHandle};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEARTBEAT_IDLE_INTERVAL: Duration = Duration::from_secs(5);
/// 10 events per 100 ms window, expressed as a minimum spacing between
/// `stats_update` emissions.
const STATS_COALESCE_WINDOW: Duration = Duration::from_millis(10);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct Cursors {
    pub instances: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    InstanceComplete { record: InstanceRecord },
    StatsUpdate { total: usize, passed: usize, failed: usize, errored: usize },
    RunComplete { summary: RunSummary },
    Heartbeat,
}

#[derive(Default)]
struct RollingTotals {
    total: usize,
    passed: usize,
    failed: usize,
    errored: usize,
}

impl RollingTotals {
    fn record(&mut self, status: InstanceStatus) {
        self.total += 1;
        match status {
            InstanceStatus::Passed => self.passed += 1,
            InstanceStatus::Failed => self.failed += 1,
            InstanceStatus::Errored => self.errored += 1,
            InstanceStatus::Running => {}
        }
    }

    fn as_event(&self) -> LiveEvent {
        LiveEvent::StatsUpdate {
            total: self.total,
            passed: self.passed,
            failed: self.failed,
            errored: self.errored,
        }
    }
}

/// Spawns a background task tailing `store` from `cursors` and returns the
/// receiving half; the task exits once `RunComplete` is sent or the receiver
/// is dropped.
pub fn tail(store: Arc<WriterHandle>, cursors: Cursors) -> mpsc::Receiver<LiveEvent> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut next_seq = cursors.instances;
        let mut totals = RollingTotals::default();
        let mut last_stats_sent = Instant::now() - STATS_COALESCE_WINDOW;
        let mut last_activity = Instant::now();
        let mut ticker = interval(POLL_INTERVAL);

        loop {
            ticker.tick().await;

            let lines = store.read_lines(Stream::Instances, next_seq).await.unwrap_or_default();
            if !lines.is_empty() {
                last_activity = Instant::now();
                for line in &lines {
                    if let Some(seq) = line.get("seq").and_then(Value::as_u64) {
                        next_seq = next_seq.max(seq + 1);
                    }
                    let Ok(record) = serde_json::from_value::<InstanceRecord>(line.clone()) else {
                        continue;
                    };
                    totals.record(record.status);
                    if tx.send(LiveEvent::InstanceComplete { record }).await.is_err() {
                        return;
                    }
                }

                if last_stats_sent.elapsed() >= STATS_COALESCE_WINDOW {
                    if tx.send(totals.as_event()).await.is_err() {
                        return;
                    }
                    last_stats_sent = Instant::now();
                }
            }

            if let Some(summary) = store.read_summary().await {
                let _ = tx.send(LiveEvent::RunComplete { summary }).await;
                return;
            }

            if last_activity.elapsed() >= HEARTBEAT_IDLE_INTERVAL {
                if tx.send(LiveEvent::Heartbeat).await.is_err() {
                    return;
                }
                last_activity = Instant::now();
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunConfig;
    use crate::scenario_runner::EventSink;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn open_store(dir: &std::path::Path, run_id: &str) -> WriterHandle {
        let cfg = RunConfig {
            run_id: run_id.to_string(),
            seed: 1,
            parallelism: 1,
            instance_target: 1,
            started_at: Utc::now(),
            completed_at: None,
        };
        crate::store::open(dir, &cfg).await.unwrap()
    }

    fn instance_record(run_id: &str, id: &str, status: InstanceStatus) -> InstanceRecord {
        InstanceRecord {
            run_id: run_id.to_string(),
            instance_id: id.to_string(),
            correlation_id: "corr".into(),
            scenario_id: "s1".into(),
            seed_prefix: 0,
            entry: json!({}),
            status,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error: None,
            steps_executed: 1,
        }
    }

    #[tokio::test]
    async fn tail_emits_instance_complete_then_run_complete() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open_store(dir.path(), "run-live").await);
        store
            .on_instance_complete(&instance_record("run-live", "inst-1", InstanceStatus::Passed))
            .await;

        let summary = RunSummary {
            run_id: "run-live".into(),
            total: 1,
            passed: 1,
            failed: 0,
            errored: 0,
            pass_rate: 1.0,
            duration_ms: 1.0,
            latency_by_action: Default::default(),
            latency_by_service: Default::default(),
        };
        store.finalize(&summary).await.unwrap();

        let mut rx = tail(store, Cursors::default());
        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, LiveEvent::InstanceComplete { .. }));

        let mut saw_run_complete = false;
        for _ in 0..5 {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
                LiveEvent::RunComplete { .. } => {
                    saw_run_complete = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_run_complete);
    }

    #[test]
    fn rolling_totals_count_by_status() {
        let mut totals = RollingTotals::default();
        totals.record(InstanceStatus::Passed);
        totals.record(InstanceStatus::Failed);
        totals.record(InstanceStatus::Errored);
        assert_eq!(totals.total, 3);
        assert_eq!(totals.passed, 1);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.errored, 1);
    }
}
