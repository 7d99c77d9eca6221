//! Flow journal: durable record of runs, completed steps and signals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::FlowStatus;
use crate::error::{BridgeError, BridgeResult};

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub run_id: i64,
    pub flow_id: String,
    pub flow_type: String,
    pub queue: String,
    pub status: FlowStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<BridgeError>,
    /// Last value the flow published while running
    pub progress: Option<Value>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recorded result of a completed step; terminal errors are kept with their class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum StepOutcome {
    Ok(Value),
    Err(BridgeError),
}

impl StepOutcome {
    pub fn into_result(self) -> BridgeResult<Value> {
        match self {
            StepOutcome::Ok(value) => Ok(value),
            StepOutcome::Err(err) => Err(err),
        }
    }
}

impl From<&BridgeResult<Value>> for StepOutcome {
    fn from(result: &BridgeResult<Value>) -> Self {
        match result {
            Ok(value) => StepOutcome::Ok(value.clone()),
            Err(err) => StepOutcome::Err(err.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: i64,
    pub seq: i32,
    pub name: String,
    pub outcome: StepOutcome,
}

/// Journal step name under which a signal wait is recorded.
pub fn signal_step_name(signal: &str) -> String {
    format!("signal:{signal}")
}

/// Recorded value of a signal wait.
pub fn signal_outcome(payload: Option<Value>) -> Value {
    match payload {
        Some(payload) => json!({ "received": true, "payload": payload }),
        None => json!({ "received": false }),
    }
}

/// Inverse of [`signal_outcome`].
pub fn parse_signal_outcome(value: &Value) -> Option<Value> {
    if value.get("received").and_then(Value::as_bool) == Some(true) {
        Some(value.get("payload").cloned().unwrap_or(Value::Null))
    } else {
        None
    }
}

#[async_trait]
pub trait FlowJournal: Send + Sync {
    /// Fails with `FlowAlreadyRunning` when `flow_id` has an open run.
    async fn create_flow(
        &self,
        flow_id: &str,
        flow_type: &str,
        queue: &str,
        input: &Value,
    ) -> BridgeResult<FlowRecord>;

    /// Move the oldest scheduled run of `queue` to running and return it.
    async fn claim_next(&self, queue: &str) -> BridgeResult<Option<FlowRecord>>;

    /// Close an open run. Returns false if it was already closed.
    async fn finish_flow(
        &self,
        run_id: i64,
        status: FlowStatus,
        output: Option<&Value>,
        error: Option<&BridgeError>,
    ) -> BridgeResult<bool>;

    async fn flow(&self, run_id: i64) -> BridgeResult<Option<FlowRecord>>;

    async fn open_run(&self, flow_id: &str) -> BridgeResult<Option<FlowRecord>>;

    async fn request_cancel(&self, run_id: i64) -> BridgeResult<bool>;

    async fn load_step(&self, run_id: i64, seq: i32) -> BridgeResult<Option<StepRecord>>;

    /// Record a step. The first record for a sequence number wins.
    async fn save_step(&self, step: &StepRecord) -> BridgeResult<()>;

    async fn push_signal(&self, run_id: i64, name: &str, payload: &Value) -> BridgeResult<()>;

    /// Consume the oldest pending signal and record it as step `seq`, atomically.
    async fn consume_signal(&self, run_id: i64, name: &str, seq: i32)
        -> BridgeResult<Option<Value>>;

    async fn set_progress(&self, run_id: i64, progress: &Value) -> BridgeResult<()>;

    /// Reschedule runs left running by a previous process.
    async fn requeue_interrupted(&self) -> BridgeResult<u64>;

    async fn count_by_status(&self) -> BridgeResult<Vec<(FlowStatus, i64)>>;
}

struct SignalRow {
    run_id: i64,
    name: String,
    payload: Value,
    consumed: bool,
}

#[derive(Default)]
struct JournalState {
    next_run_id: i64,
    runs: BTreeMap<i64, FlowRecord>,
    steps: HashMap<(i64, i32), StepRecord>,
    signals: Vec<SignalRow>,
}

/// In-memory journal for tests and single-process development.
#[derive(Default)]
pub struct MemoryFlowJournal {
    state: Mutex<JournalState>,
}

impl MemoryFlowJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowJournal for MemoryFlowJournal {
    async fn create_flow(
        &self,
        flow_id: &str,
        flow_type: &str,
        queue: &str,
        input: &Value,
    ) -> BridgeResult<FlowRecord> {
        let mut state = self.state.lock().await;
        if state
            .runs
            .values()
            .any(|r| r.flow_id == flow_id && r.status.is_open())
        {
            return Err(BridgeError::FlowAlreadyRunning(flow_id.to_string()));
        }

        state.next_run_id += 1;
        let now = Utc::now();
        let record = FlowRecord {
            run_id: state.next_run_id,
            flow_id: flow_id.to_string(),
            flow_type: flow_type.to_string(),
            queue: queue.to_string(),
            status: FlowStatus::Scheduled,
            input: input.clone(),
            output: None,
            error: None,
            progress: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(record.run_id, record.clone());
        Ok(record)
    }

    async fn claim_next(&self, queue: &str) -> BridgeResult<Option<FlowRecord>> {
        let mut state = self.state.lock().await;
        let next = state
            .runs
            .values_mut()
            .find(|r| r.queue == queue && r.status == FlowStatus::Scheduled);
        Ok(next.map(|record| {
            record.status = FlowStatus::Running;
            record.updated_at = Utc::now();
            record.clone()
        }))
    }

    async fn finish_flow(
        &self,
        run_id: i64,
        status: FlowStatus,
        output: Option<&Value>,
        error: Option<&BridgeError>,
    ) -> BridgeResult<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(record) if record.status.is_open() => {
                record.status = status;
                record.output = output.cloned();
                record.error = error.cloned();
                record.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BridgeError::NotFound(format!("flow run {run_id}"))),
        }
    }

    async fn flow(&self, run_id: i64) -> BridgeResult<Option<FlowRecord>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn open_run(&self, flow_id: &str) -> BridgeResult<Option<FlowRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .find(|r| r.flow_id == flow_id && r.status.is_open())
            .cloned())
    }

    async fn request_cancel(&self, run_id: i64) -> BridgeResult<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(record) if record.status.is_open() => {
                record.cancel_requested = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BridgeError::NotFound(format!("flow run {run_id}"))),
        }
    }

    async fn load_step(&self, run_id: i64, seq: i32) -> BridgeResult<Option<StepRecord>> {
        Ok(self.state.lock().await.steps.get(&(run_id, seq)).cloned())
    }

    async fn save_step(&self, step: &StepRecord) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        state
            .steps
            .entry((step.run_id, step.seq))
            .or_insert_with(|| step.clone());
        Ok(())
    }

    async fn push_signal(&self, run_id: i64, name: &str, payload: &Value) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        state.signals.push(SignalRow {
            run_id,
            name: name.to_string(),
            payload: payload.clone(),
            consumed: false,
        });
        Ok(())
    }

    async fn consume_signal(
        &self,
        run_id: i64,
        name: &str,
        seq: i32,
    ) -> BridgeResult<Option<Value>> {
        let mut state = self.state.lock().await;
        let Some(signal) = state
            .signals
            .iter_mut()
            .find(|s| s.run_id == run_id && s.name == name && !s.consumed)
        else {
            return Ok(None);
        };
        signal.consumed = true;
        let payload = signal.payload.clone();

        state.steps.entry((run_id, seq)).or_insert_with(|| StepRecord {
            run_id,
            seq,
            name: signal_step_name(name),
            outcome: StepOutcome::Ok(signal_outcome(Some(payload.clone()))),
        });
        Ok(Some(payload))
    }

    async fn set_progress(&self, run_id: i64, progress: &Value) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| BridgeError::NotFound(format!("flow run {run_id}")))?;
        record.progress = Some(progress.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_interrupted(&self) -> BridgeResult<u64> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for record in state.runs.values_mut() {
            if record.status == FlowStatus::Running {
                record.status = FlowStatus::Scheduled;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn count_by_status(&self) -> BridgeResult<Vec<(FlowStatus, i64)>> {
        let state = self.state.lock().await;
        Ok(FlowStatus::ALL
            .into_iter()
            .map(|status| {
                let count = state.runs.values().filter(|r| r.status == status).count();
                (status, count as i64)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }
}
