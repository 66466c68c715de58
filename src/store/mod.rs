//! # Artifact store (§4.8)
//!
//! One directory per run, `runs/<run_id>/`, holding `manifest.json`,
//! append-only `instances.jsonl`/`steps.jsonl`/`assertions.jsonl` streams, a
//! per-instance `artifacts/<instance_id>/` subdirectory for raw request and
//! response payloads, and finally `summary.json` written once at `finalize`.
//!
//! Each stream is a single self-contained JSON line carrying a monotonic,
//! 0-based `seq` plus a UTC timestamp. A `tokio::sync::Mutex` per stream
//! serializes concurrent instance writers into the one file that stream
//! owns; every write is followed by an explicit flush so a crashed process
//! leaves a readable prefix rather than a torn line.
//!
//! A write that fails (disk full, permission error) is retried a bounded
//! number of times with a fixed delay; on exhaustion the error propagates to
//! the caller instead of being swallowed, so `scenario_runner` can mark the
//! instance `errored` with kind `store_write` (§7) rather than silently
//! losing the record while still reporting `passed`/`failed`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{ErrorKind, ObservedError};
use crate::model::{AssertionResult, InstanceRecord, Observation, RunConfig, RunSummary};
use crate::scenario_runner::EventSink;
use tracing::warn;

const MAX_WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Instances,
    Steps,
    Assertions,
}

impl Stream {
    fn file_name(self) -> &'static str {
        match self {
            Stream::Instances => "instances.jsonl",
            Stream::Steps => "steps.jsonl",
            Stream::Assertions => "assertions.jsonl",
        }
    }
}

struct StreamWriter {
    file: AsyncMutex<File>,
    next_seq: AtomicU64,
}

impl StreamWriter {
    async fn create(path: &Path) -> Result<Self, ObservedError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;
        Ok(Self { file: AsyncMutex::new(file), next_seq: AtomicU64::new(0) })
    }

    async fn append(&self, payload: Value) -> Result<u64, ObservedError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut record = serde_json::Map::new();
        record.insert("seq".to_string(), Value::from(seq));
        record.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
        if let Value::Object(fields) = payload {
            for (k, v) in fields {
                record.insert(k, v);
            }
        }
        let mut line = serde_json::to_string(&Value::Object(record))
            .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;
        line.push('\n');

        let mut last_err = None;
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            if attempt > 0 {
                warn!(attempt, MAX_WRITE_ATTEMPTS, "stream write failed, retrying");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
            match self.try_write(&line).await {
                Ok(()) => return Ok(seq),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ObservedError::new(ErrorKind::StoreWrite, "write failed with no recorded error")
        }))
    }

    async fn try_write(&self, line: &str) -> Result<(), ObservedError> {
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;
        file.flush().await.map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))
    }
}

/// An exclusive handle on one run's directory, returned by `open`.
pub struct WriterHandle {
    root: PathBuf,
    run_id: String,
    instances: StreamWriter,
    steps: StreamWriter,
    assertions: StreamWriter,
}

impl WriterHandle {
    fn stream_path(&self, stream: Stream) -> PathBuf {
        self.root.join(stream.file_name())
    }

    /// Persists the raw request/response payload too large to inline in
    /// `steps.jsonl`, under `artifacts/<instance_id>/<step_seq>_{request,response}.json`.
    pub async fn write_artifact(
        &self,
        instance_id: &str,
        step_seq: u64,
        kind: &str,
        payload: &Value,
    ) -> Result<(), ObservedError> {
        let dir = self.root.join("artifacts").join(instance_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;
        let path = dir.join(format!("{step_seq}_{kind}.json"));
        let body = serde_json::to_vec_pretty(payload)
            .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;
        fs::write(path, body)
            .await
            .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))
    }

    /// Writes `summary.json` and marks the run complete. Invariant (§4.8c):
    /// `summary.json` exists iff every declared instance has a completion
    /// record — callers are expected to call this only after every spawned
    /// instance's `on_instance_complete` has landed.
    pub async fn finalize(&self, summary: &RunSummary) -> Result<(), ObservedError> {
        write_json_file(&self.root.join("summary.json"), summary).await
    }

    /// Reads every record with `seq >= from_seq` from one stream — the
    /// live-tailing cursor contract. Re-reads the file from disk each call;
    /// fine at this scale, and correct even across process restarts.
    pub async fn read_lines(&self, stream: Stream, from_seq: u64) -> Result<Vec<Value>, ObservedError> {
        let path = self.stream_path(stream);
        let text = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ObservedError::new(ErrorKind::StoreCorrupt, e.to_string())),
        };

        let mut out = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|e| ObservedError::new(ErrorKind::StoreCorrupt, e.to_string()))?;
            let seq = value.get("seq").and_then(Value::as_u64).unwrap_or(0);
            if seq >= from_seq {
                out.push(value);
            }
        }
        Ok(out)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// `Some` once `finalize` has written `summary.json`; used by the live
    /// channel to detect run completion without the scheduler signalling it
    /// directly.
    pub async fn read_summary(&self) -> Option<RunSummary> {
        let text = fs::read_to_string(self.root.join("summary.json")).await.ok()?;
        serde_json::from_str(&text).ok()
    }
}

#[async_trait::async_trait]
impl EventSink for WriterHandle {
    async fn on_step(
        &self,
        instance_id: &str,
        step_name: &str,
        observation: &Observation,
    ) -> Result<(), ObservedError> {
        let payload = serde_json::json!({
            "run_id": self.run_id,
            "instance_id": instance_id,
            "step_name": step_name,
            "observation": observation,
        });
        self.steps.append(payload).await.map(|_| ())
    }

    async fn on_assertion(
        &self,
        instance_id: &str,
        result: &AssertionResult,
    ) -> Result<(), ObservedError> {
        let payload = serde_json::json!({
            "run_id": self.run_id,
            "instance_id": instance_id,
            "result": result,
        });
        self.assertions.append(payload).await.map(|_| ())
    }

    async fn on_instance_complete(&self, record: &InstanceRecord) {
        let payload = serde_json::to_value(record).unwrap_or(Value::Null);
        if let Err(e) = self.instances.append(payload).await {
            warn!(
                instance_id = %record.instance_id,
                error = %e,
                "failed to persist instance completion record after retries"
            );
        }
    }
}

/// Opens (creating if absent) the per-run directory and writes `manifest.json`.
/// Exclusive in the sense that the caller owns the only `WriterHandle` for
/// this `run_id` — nothing in this module enforces a process-wide lock beyond
/// that convention (§Non-goals: no distributed coordination).
pub async fn open(base_dir: &Path, run_cfg: &RunConfig) -> Result<WriterHandle, ObservedError> {
    let root = base_dir.join("runs").join(&run_cfg.run_id);
    fs::create_dir_all(&root)
        .await
        .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;

    write_json_file(&root.join("manifest.json"), run_cfg).await?;

    Ok(WriterHandle {
        instances: StreamWriter::create(&root.join(Stream::Instances.file_name())).await?,
        steps: StreamWriter::create(&root.join(Stream::Steps.file_name())).await?,
        assertions: StreamWriter::create(&root.join(Stream::Assertions.file_name())).await?,
        run_id: run_cfg.run_id.clone(),
        root,
    })
}

async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), ObservedError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))?;
    fs::write(path, body)
        .await
        .map_err(|e| ObservedError::new(ErrorKind::StoreWrite, e.to_string()))
}

/// Reads a whole file back into memory; used only by tests and by the CLI's
/// `replay` path, never on the hot write path.
#[allow(dead_code)]
async fn read_whole_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).await?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceStatus;
    use tempfile::tempdir;

    fn run_cfg(run_id: &str) -> RunConfig {
        RunConfig {
            run_id: run_id.to_string(),
            seed: 1,
            parallelism: 2,
            instance_target: 3,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn open_creates_manifest_and_empty_streams() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path(), &run_cfg("run-a")).await.unwrap();
        assert!(dir.path().join("runs/run-a/manifest.json").exists());
        assert_eq!(handle.read_lines(Stream::Steps, 0).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn appended_steps_get_dense_monotonic_seq() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path(), &run_cfg("run-b")).await.unwrap();

        for i in 0..3 {
            let obs = Observation::passed(format!("step-{i}"), 1.0);
            handle.on_step("inst-1", &obs.step_name, &obs).await.unwrap();
        }

        let lines = handle.read_lines(Stream::Steps, 0).await.unwrap();
        let seqs: Vec<u64> = lines.iter().map(|v| v["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn read_lines_honors_from_seq_cursor() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path(), &run_cfg("run-c")).await.unwrap();
        for i in 0..5 {
            let obs = Observation::passed(format!("step-{i}"), 1.0);
            handle.on_step("inst-1", &obs.step_name, &obs).await.unwrap();
        }

        let lines = handle.read_lines(Stream::Steps, 3).await.unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn finalize_writes_summary_json() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path(), &run_cfg("run-d")).await.unwrap();
        let summary = RunSummary {
            run_id: "run-d".into(),
            total: 1,
            passed: 1,
            failed: 0,
            errored: 0,
            pass_rate: 1.0,
            duration_ms: 5.0,
            latency_by_action: Default::default(),
            latency_by_service: Default::default(),
        };
        handle.finalize(&summary).await.unwrap();
        assert!(dir.path().join("runs/run-d/summary.json").exists());
    }

    #[tokio::test]
    async fn instance_complete_records_land_in_instances_stream() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path(), &run_cfg("run-e")).await.unwrap();
        let record = InstanceRecord {
            run_id: "run-e".into(),
            instance_id: "inst-1".into(),
            correlation_id: "corr-1".into(),
            scenario_id: "s1".into(),
            seed_prefix: 0,
            entry: Value::Null,
            status: InstanceStatus::Passed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error: None,
            steps_executed: 2,
        };
        handle.on_instance_complete(&record).await;
        let lines = handle.read_lines(Stream::Instances, 0).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["instance_id"], "inst-1");
    }
}
