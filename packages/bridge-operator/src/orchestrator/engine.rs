//! Flow engine
//!
//! Each task queue gets a dispatcher that claims scheduled runs from the
//! journal and executes them on a bounded number of workers. A flow talks to
//! the outside world only through its [`FlowContext`]: activities, signal
//! waits and progress. Steps are numbered in the order the flow issues them,
//! and a step already in the journal is replayed instead of executed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use super::journal::{
    parse_signal_outcome, signal_outcome, signal_step_name, FlowJournal, FlowRecord, StepOutcome,
    StepRecord,
};
use super::retry::{ActivityClass, RetryPolicy};
use super::{FlowHandle, FlowStatus, Orchestration};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

type FlowFn = Arc<dyn Fn(FlowContext, Value) -> BoxFuture<'static, BridgeResult<Value>> + Send + Sync>;
type ActivityFn = Arc<dyn Fn(Value) -> BoxFuture<'static, BridgeResult<Value>> + Send + Sync>;

struct FlowDef {
    queue: String,
    run: FlowFn,
}

struct ActivityDef {
    policy: RetryPolicy,
    run: ActivityFn,
}

struct QueueState {
    workers: usize,
    wakeup: Notify,
}

struct EngineInner {
    journal: Arc<dyn FlowJournal>,
    flows: HashMap<String, FlowDef>,
    activities: HashMap<String, ActivityDef>,
    queues: HashMap<String, QueueState>,
    /// Woken on every signal, progress update, cancellation and finished run
    events: Notify,
    poll_interval: Duration,
}

/// Registers queues, flows and activities before the engine starts.
pub struct EngineBuilder {
    journal: Arc<dyn FlowJournal>,
    queues: HashMap<String, usize>,
    flows: HashMap<String, FlowDef>,
    activities: HashMap<String, ActivityDef>,
    poll_interval: Duration,
}

impl EngineBuilder {
    pub fn new(journal: Arc<dyn FlowJournal>) -> Self {
        Self {
            journal,
            queues: HashMap::new(),
            flows: HashMap::new(),
            activities: HashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Declare a task queue served by `workers` concurrent runs.
    pub fn queue(mut self, name: &str, workers: usize) -> Self {
        self.queues.insert(name.to_string(), workers.max(1));
        self
    }

    /// Register a flow type on a queue. Input and output travel as JSON.
    pub fn flow<I, O, F, Fut>(mut self, name: &str, queue: &str, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(FlowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<O>> + Send + 'static,
    {
        let run: FlowFn = Arc::new(move |ctx, input| match serde_json::from_value::<I>(input) {
            Ok(input) => {
                let fut = f(ctx, input);
                async move { Ok(serde_json::to_value(fut.await?)?) }.boxed()
            }
            Err(e) => future::ready(Err(e.into())).boxed(),
        });
        self.queues.entry(queue.to_string()).or_insert(1);
        self.flows.insert(
            name.to_string(),
            FlowDef {
                queue: queue.to_string(),
                run,
            },
        );
        self
    }

    /// Register a named activity with its retry policy.
    pub fn activity<I, O, F, Fut>(mut self, name: &str, policy: impl Into<RetryPolicy>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<O>> + Send + 'static,
    {
        let run: ActivityFn = Arc::new(move |input| match serde_json::from_value::<I>(input) {
            Ok(input) => {
                let fut = f(input);
                async move { Ok(serde_json::to_value(fut.await?)?) }.boxed()
            }
            Err(e) => future::ready(Err(e.into())).boxed(),
        });
        self.activities.insert(
            name.to_string(),
            ActivityDef {
                policy: policy.into(),
                run,
            },
        );
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> FlowEngine {
        let queues = self
            .queues
            .into_iter()
            .map(|(name, workers)| {
                (
                    name,
                    QueueState {
                        workers,
                        wakeup: Notify::new(),
                    },
                )
            })
            .collect();

        FlowEngine {
            inner: Arc::new(EngineInner {
                journal: self.journal,
                flows: self.flows,
                activities: self.activities,
                queues,
                events: Notify::new(),
                poll_interval: self.poll_interval,
            }),
        }
    }
}

#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    pub fn journal(&self) -> &Arc<dyn FlowJournal> {
        &self.inner.journal
    }

    /// Serve every queue until shutdown. Runs left open by a previous process
    /// are rescheduled first and resume by replay.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        let requeued = self.inner.journal.requeue_interrupted().await?;
        info!(
            queues = self.inner.queues.len(),
            flows = self.inner.flows.len(),
            activities = self.inner.activities.len(),
            requeued,
            "Flow engine starting"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatchers: Vec<_> = self
            .inner
            .queues
            .keys()
            .map(|queue| tokio::spawn(self.clone().dispatch(queue.clone(), stop_rx.clone())))
            .collect();

        let _ = shutdown.recv().await;
        info!("Flow engine shutdown requested");
        let _ = stop_tx.send(true);
        for dispatcher in dispatchers {
            let _ = dispatcher.await;
        }
        info!("Flow engine stopped");
        Ok(())
    }

    async fn dispatch(self, queue: String, mut stop: watch::Receiver<bool>) {
        let Some(state) = self.inner.queues.get(&queue) else {
            return;
        };
        let workers = state.workers;
        let slots = Arc::new(Semaphore::new(workers));
        debug!(queue = %queue, workers, "Queue dispatcher started");

        loop {
            if *stop.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = stop.changed() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.inner.journal.claim_next(&queue).await {
                Ok(Some(record)) => {
                    metrics::set_queue_in_flight(&queue, workers - slots.available_permits());
                    let engine = self.clone();
                    let slots = slots.clone();
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        engine.execute_run(record).await;
                        drop(permit);
                        metrics::set_queue_in_flight(&queue, workers - slots.available_permits());
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(queue = %queue, error = %e, "Failed to claim next flow run");
                }
            }

            tokio::select! {
                _ = stop.changed() => break,
                _ = state.wakeup.notified() => {}
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }

        debug!(queue = %queue, "Queue dispatcher stopped");
    }

    async fn execute_run(&self, record: FlowRecord) {
        if record.cancel_requested {
            self.finish_run(&record, Err(BridgeError::Canceled)).await;
            return;
        }

        let Some(def) = self.inner.flows.get(&record.flow_type) else {
            error!(run_id = record.run_id, flow_type = %record.flow_type, "Unknown flow type");
            self.finish_run(&record, Err(BridgeError::UnknownFlow(record.flow_type.clone())))
                .await;
            return;
        };

        debug!(
            run_id = record.run_id,
            flow_id = %record.flow_id,
            flow_type = %record.flow_type,
            "Executing flow run"
        );
        let ctx = FlowContext {
            engine: self.clone(),
            run_id: record.run_id,
            flow_id: record.flow_id.clone(),
            seq: 0,
        };
        let result = (def.run)(ctx, record.input.clone()).await;
        self.finish_run(&record, result).await;
    }

    async fn finish_run(&self, record: &FlowRecord, result: BridgeResult<Value>) {
        let (status, output, error) = match result {
            Ok(output) => (FlowStatus::Completed, Some(output), None),
            Err(BridgeError::Canceled) => (FlowStatus::Canceled, None, Some(BridgeError::Canceled)),
            Err(e) => (FlowStatus::Failed, None, Some(e)),
        };

        let journal = &self.inner.journal;
        let (output_ref, error_ref) = (output.as_ref(), error.as_ref());
        let finished = with_storage_retry(move || {
            journal.finish_flow(record.run_id, status, output_ref, error_ref)
        })
        .await;

        match finished {
            Ok(true) => {
                metrics::record_flow_finished(&record.flow_type, status.as_str());
                match &error {
                    Some(e) if status == FlowStatus::Failed => warn!(
                        run_id = record.run_id,
                        flow_id = %record.flow_id,
                        flow_type = %record.flow_type,
                        error = %e,
                        "Flow failed"
                    ),
                    _ => info!(
                        run_id = record.run_id,
                        flow_id = %record.flow_id,
                        flow_type = %record.flow_type,
                        status = %status,
                        "Flow finished"
                    ),
                }
            }
            Ok(false) => debug!(run_id = record.run_id, "Flow run was already closed"),
            Err(e) => error!(
                run_id = record.run_id,
                error = %e,
                "Failed to record flow result; run will resume after restart"
            ),
        }
        self.inner.events.notify_waiters();
    }

    async fn open_run(&self, flow_id: &str) -> BridgeResult<FlowRecord> {
        self.inner
            .journal
            .open_run(flow_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("open flow {flow_id}")))
    }

    /// Poll the run until `ready` yields, waking early on engine events.
    async fn watch_run<T>(
        &self,
        run_id: i64,
        ready: impl Fn(&FlowRecord) -> Option<BridgeResult<T>>,
    ) -> BridgeResult<T> {
        loop {
            let notified = self.inner.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self
                .inner
                .journal
                .flow(run_id)
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("flow run {run_id}")))?;
            if let Some(result) = ready(&record) {
                return result;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }
}

fn finished_result(record: &FlowRecord) -> Option<BridgeResult<Value>> {
    match record.status {
        FlowStatus::Completed => Some(Ok(record.output.clone().unwrap_or(Value::Null))),
        FlowStatus::Failed => Some(Err(record
            .error
            .clone()
            .unwrap_or_else(|| BridgeError::storage("run failed without a recorded error")))),
        FlowStatus::Canceled => Some(Err(BridgeError::Canceled)),
        FlowStatus::Scheduled | FlowStatus::Running => None,
    }
}

#[async_trait]
impl Orchestration for FlowEngine {
    async fn start_flow(
        &self,
        flow_type: &str,
        flow_id: &str,
        input: Value,
    ) -> BridgeResult<FlowHandle> {
        let def = self
            .inner
            .flows
            .get(flow_type)
            .ok_or_else(|| BridgeError::UnknownFlow(flow_type.to_string()))?;

        let record = self
            .inner
            .journal
            .create_flow(flow_id, flow_type, &def.queue, &input)
            .await?;
        metrics::record_flow_started(flow_type);
        if let Some(queue) = self.inner.queues.get(&def.queue) {
            queue.wakeup.notify_one();
        }

        info!(run_id = record.run_id, flow_id, flow_type, queue = %def.queue, "Flow started");
        Ok(FlowHandle {
            flow_id: record.flow_id,
            run_id: record.run_id,
        })
    }

    async fn signal_flow(&self, flow_id: &str, signal: &str, payload: Value) -> BridgeResult<()> {
        let record = self.open_run(flow_id).await?;
        self.inner
            .journal
            .push_signal(record.run_id, signal, &payload)
            .await?;
        debug!(run_id = record.run_id, flow_id, signal, "Signal delivered");
        self.inner.events.notify_waiters();
        Ok(())
    }

    async fn cancel_flow(&self, flow_id: &str) -> BridgeResult<()> {
        let record = self.open_run(flow_id).await?;
        self.inner.journal.request_cancel(record.run_id).await?;
        if record.status == FlowStatus::Scheduled {
            // Never started; close it here. A worker that claims it first sees the flag.
            self.finish_run(&record, Err(BridgeError::Canceled)).await;
        } else {
            self.inner.events.notify_waiters();
        }
        info!(run_id = record.run_id, flow_id, "Flow cancellation requested");
        Ok(())
    }

    async fn flow_result(&self, handle: &FlowHandle) -> BridgeResult<Value> {
        self.watch_run(handle.run_id, finished_result).await
    }

    async fn flow_progress(&self, handle: &FlowHandle) -> BridgeResult<Value> {
        self.watch_run(handle.run_id, |record| match &record.progress {
            Some(progress) => Some(Ok(progress.clone())),
            None => finished_result(record),
        })
        .await
    }
}

/// Retry a journal operation on transient storage errors.
async fn with_storage_retry<T, F, Fut>(op: F) -> BridgeResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let policy = RetryPolicy::for_class(ActivityClass::Storage);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Err(e) if e.is_retryable() && policy.should_retry(attempts) => {
                warn!(attempt = attempts, error = %e, "Journal operation failed, retrying");
                tokio::time::sleep(policy.backoff_for_attempt(attempts - 1)).await;
            }
            result => return result,
        }
    }
}

fn decode<O: DeserializeOwned>(result: BridgeResult<Value>) -> BridgeResult<O> {
    result.and_then(|value| serde_json::from_value(value).map_err(Into::into))
}

/// Handle a running flow uses to issue steps.
pub struct FlowContext {
    engine: FlowEngine,
    run_id: i64,
    flow_id: String,
    seq: i32,
}

impl FlowContext {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    fn next_seq(&mut self) -> i32 {
        self.seq += 1;
        self.seq
    }

    /// The recorded step at `seq`, checked against the name the flow issues now.
    async fn recorded_step(&self, seq: i32, name: &str) -> BridgeResult<Option<StepRecord>> {
        let journal = &self.engine.inner.journal;
        let run_id = self.run_id;
        let step = with_storage_retry(move || journal.load_step(run_id, seq)).await?;
        match step {
            Some(step) if step.name != name => Err(BridgeError::NonDeterministic(format!(
                "step {seq} of run {run_id} was recorded as {} but the flow issued {name}",
                step.name
            ))),
            step => Ok(step),
        }
    }

    async fn record_step(&self, step: &StepRecord) -> BridgeResult<()> {
        let journal = &self.engine.inner.journal;
        with_storage_retry(move || journal.save_step(step)).await
    }

    async fn check_canceled(&self) -> BridgeResult<()> {
        let record = self.engine.inner.journal.flow(self.run_id).await?;
        match record {
            Some(record) if record.cancel_requested => Err(BridgeError::Canceled),
            _ => Ok(()),
        }
    }

    /// Run a named activity, or replay its recorded outcome.
    ///
    /// Retryable failures are retried under the activity's policy; the first
    /// terminal failure is recorded and returned unchanged.
    pub async fn execute_activity<I, O>(&mut self, name: &str, input: &I) -> BridgeResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let seq = self.next_seq();
        if let Some(step) = self.recorded_step(seq, name).await? {
            debug!(run_id = self.run_id, seq, activity = name, "Replaying recorded step");
            return decode(step.outcome.into_result());
        }

        let def = self
            .engine
            .inner
            .activities
            .get(name)
            .ok_or_else(|| BridgeError::UnknownActivity(name.to_string()))?;
        let input = serde_json::to_value(input)?;
        self.check_canceled().await?;

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match (def.run)(input.clone()).await {
                Ok(output) => {
                    metrics::record_activity_attempt(name, "ok");
                    break Ok(output);
                }
                Err(e) if e.is_retryable() && def.policy.should_retry(attempts) => {
                    metrics::record_activity_attempt(name, "retry");
                    let backoff = def.policy.backoff_for_attempt(attempts - 1);
                    debug!(
                        run_id = self.run_id,
                        activity = name,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Activity failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    self.check_canceled().await?;
                }
                Err(e) => {
                    metrics::record_activity_attempt(name, "failed");
                    warn!(
                        run_id = self.run_id,
                        activity = name,
                        attempts,
                        error = %e,
                        "Activity failed"
                    );
                    break Err(e);
                }
            }
        };

        self.record_step(&StepRecord {
            run_id: self.run_id,
            seq,
            name: name.to_string(),
            outcome: StepOutcome::from(&result),
        })
        .await?;
        decode(result)
    }

    /// Wait for a named signal until `deadline`. `None` on timeout.
    pub async fn wait_signal(
        &mut self,
        signal: &str,
        deadline: DateTime<Utc>,
    ) -> BridgeResult<Option<Value>> {
        let seq = self.next_seq();
        let step_name = signal_step_name(signal);
        if let Some(step) = self.recorded_step(seq, &step_name).await? {
            return Ok(parse_signal_outcome(&step.outcome.into_result()?));
        }

        let journal = self.engine.inner.journal.clone();
        let run_id = self.run_id;
        loop {
            let notified = self.engine.inner.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let journal_ref = &journal;
            if let Some(payload) =
                with_storage_retry(move || journal_ref.consume_signal(run_id, signal, seq)).await?
            {
                debug!(run_id, signal, "Signal received");
                return Ok(Some(payload));
            }
            self.check_canceled().await?;

            let now = Utc::now();
            if now >= deadline {
                self.record_step(&StepRecord {
                    run_id,
                    seq,
                    name: step_name,
                    outcome: StepOutcome::Ok(signal_outcome(None)),
                })
                .await?;
                debug!(run_id, signal, "Signal wait timed out");
                return Ok(None);
            }

            let remaining = (deadline - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.engine.inner.poll_interval);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Publish an intermediate result for `flow_progress` callers.
    pub async fn publish<T: Serialize + ?Sized>(&self, progress: &T) -> BridgeResult<()> {
        let value = serde_json::to_value(progress)?;
        self.engine
            .inner
            .journal
            .set_progress(self.run_id, &value)
            .await?;
        self.engine.inner.events.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MemoryFlowJournal;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const Q: &str = "test-queue";

    fn builder(journal: Arc<MemoryFlowJournal>, calls: Arc<AtomicU32>) -> EngineBuilder {
        let doubled = calls.clone();
        let flaky = calls.clone();
        let failing = calls;
        EngineBuilder::new(journal)
            .queue(Q, 4)
            .poll_interval(Duration::from_millis(10))
            .activity("Double", RetryPolicy::immediate(1), move |x: u64| {
                doubled.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, BridgeError>(x * 2) }
            })
            .activity("Flaky", RetryPolicy::immediate(5), move |x: u64| {
                let n = flaky.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BridgeError::Rpc("connection reset".into()))
                    } else {
                        Ok(x)
                    }
                }
            })
            .activity("AlwaysRpc", RetryPolicy::immediate(2), move |_: u64| {
                failing.fetch_add(1, Ordering::SeqCst);
                async move { Err::<u64, _>(BridgeError::Rpc("down".into())) }
            })
            .activity("Mismatch", RetryPolicy::immediate(5), |_: u64| async move {
                Err::<u64, _>(BridgeError::AddressMismatch)
            })
            .flow("Twice", Q, |mut ctx: FlowContext, x: u64| async move {
                let a: u64 = ctx.execute_activity("Double", &x).await?;
                let b: u64 = ctx.execute_activity("Double", &a).await?;
                Ok::<_, BridgeError>(b)
            })
            .flow("Single", Q, |mut ctx: FlowContext, (name, x): (String, u64)| async move {
                let out: u64 = ctx.execute_activity(&name, &x).await?;
                Ok::<_, BridgeError>(out)
            })
            .flow("Waiter", Q, |mut ctx: FlowContext, wait_ms: i64| async move {
                ctx.publish(&json!({"waiting": true})).await?;
                let deadline = Utc::now() + chrono::Duration::milliseconds(wait_ms);
                let payload = ctx.wait_signal("go", deadline).await?;
                Ok::<_, BridgeError>(payload.unwrap_or(json!("timeout")))
            })
    }

    fn start(engine: &FlowEngine) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(engine.clone().run(rx));
        tx
    }

    async fn result_of(engine: &FlowEngine, handle: &FlowHandle) -> BridgeResult<Value> {
        tokio::time::timeout(Duration::from_secs(5), engine.flow_result(handle))
            .await
            .expect("flow finished in time")
    }

    #[tokio::test]
    async fn test_activities_run_in_order() {
        let calls = Arc::new(AtomicU32::new(0));
        let journal = Arc::new(MemoryFlowJournal::new());
        let engine = builder(journal.clone(), calls.clone()).build();
        let _shutdown = start(&engine);

        let handle = engine.start_flow("Twice", "twice-1", json!(3)).await.unwrap();
        assert_eq!(result_of(&engine, &handle).await.unwrap(), json!(12));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let first = journal.load_step(handle.run_id, 1).await.unwrap().unwrap();
        assert_eq!(first.outcome, StepOutcome::Ok(json!(6)));
    }

    #[tokio::test]
    async fn test_retryable_failure_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = builder(Arc::new(MemoryFlowJournal::new()), calls.clone()).build();
        let _shutdown = start(&engine);

        let handle = engine
            .start_flow("Single", "flaky", json!(["Flaky", 7]))
            .await
            .unwrap();
        assert_eq!(result_of(&engine, &handle).await.unwrap(), json!(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_keep_their_class() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = builder(Arc::new(MemoryFlowJournal::new()), calls.clone()).build();
        let _shutdown = start(&engine);

        let handle = engine
            .start_flow("Single", "mismatch", json!(["Mismatch", 1]))
            .await
            .unwrap();
        assert_eq!(
            result_of(&engine, &handle).await.unwrap_err(),
            BridgeError::AddressMismatch
        );

        // Retry budget exhausted: the last error surfaces unchanged
        let handle = engine
            .start_flow("Single", "exhausted", json!(["AlwaysRpc", 1]))
            .await
            .unwrap();
        assert_eq!(
            result_of(&engine, &handle).await.unwrap_err(),
            BridgeError::Rpc("down".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recorded_step_is_replayed() {
        let calls = Arc::new(AtomicU32::new(0));
        let journal = Arc::new(MemoryFlowJournal::new());
        let run = journal
            .create_flow("resumed", "Twice", Q, &json!(3))
            .await
            .unwrap();
        journal
            .save_step(&StepRecord {
                run_id: run.run_id,
                seq: 1,
                name: "Double".into(),
                outcome: StepOutcome::Ok(json!(100)),
            })
            .await
            .unwrap();

        let engine = builder(journal, calls.clone()).build();
        let _shutdown = start(&engine);
        let handle = FlowHandle {
            flow_id: "resumed".into(),
            run_id: run.run_id,
        };
        assert_eq!(result_of(&engine, &handle).await.unwrap(), json!(200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_diverging_history_fails_run() {
        let journal = Arc::new(MemoryFlowJournal::new());
        let run = journal
            .create_flow("diverged", "Twice", Q, &json!(3))
            .await
            .unwrap();
        journal
            .save_step(&StepRecord {
                run_id: run.run_id,
                seq: 1,
                name: "SomethingElse".into(),
                outcome: StepOutcome::Ok(json!(1)),
            })
            .await
            .unwrap();

        let engine = builder(journal, Arc::new(AtomicU32::new(0))).build();
        let _shutdown = start(&engine);
        let handle = FlowHandle {
            flow_id: "diverged".into(),
            run_id: run.run_id,
        };
        assert!(matches!(
            result_of(&engine, &handle).await,
            Err(BridgeError::NonDeterministic(_))
        ));
    }

    #[tokio::test]
    async fn test_signal_sent_before_wait_is_buffered() {
        let engine = builder(Arc::new(MemoryFlowJournal::new()), Arc::new(AtomicU32::new(0))).build();
        let handle = engine.start_flow("Waiter", "waiter-1", json!(5_000)).await.unwrap();
        // Engine not running yet: the signal is buffered in the journal
        engine
            .signal_flow("waiter-1", "go", json!({"request_id": "42"}))
            .await
            .unwrap();

        let _shutdown = start(&engine);
        assert_eq!(
            result_of(&engine, &handle).await.unwrap(),
            json!({"request_id": "42"})
        );
    }

    #[tokio::test]
    async fn test_signal_wait_times_out() {
        let engine = builder(Arc::new(MemoryFlowJournal::new()), Arc::new(AtomicU32::new(0))).build();
        let _shutdown = start(&engine);
        let handle = engine.start_flow("Waiter", "waiter-2", json!(30)).await.unwrap();
        assert_eq!(result_of(&engine, &handle).await.unwrap(), json!("timeout"));
    }

    #[tokio::test]
    async fn test_progress_duplicate_start_and_cancel() {
        let engine = builder(Arc::new(MemoryFlowJournal::new()), Arc::new(AtomicU32::new(0))).build();
        let _shutdown = start(&engine);
        let handle = engine.start_flow("Waiter", "waiter-3", json!(60_000)).await.unwrap();

        let progress = tokio::time::timeout(Duration::from_secs(5), engine.flow_progress(&handle))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress, json!({"waiting": true}));

        let err = engine
            .start_flow("Waiter", "waiter-3", json!(1))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::FlowAlreadyRunning("waiter-3".into()));

        engine.cancel_flow("waiter-3").await.unwrap();
        assert_eq!(
            result_of(&engine, &handle).await.unwrap_err(),
            BridgeError::Canceled
        );
        assert!(engine.signal_flow("waiter-3", "go", json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let engine = builder(Arc::new(MemoryFlowJournal::new()), Arc::new(AtomicU32::new(0))).build();
        let handle = engine.start_flow("Twice", "never-runs", json!(1)).await.unwrap();
        engine.cancel_flow("never-runs").await.unwrap();
        assert_eq!(
            result_of(&engine, &handle).await.unwrap_err(),
            BridgeError::Canceled
        );
    }

    #[tokio::test]
    async fn test_unknown_flow_type_rejected() {
        let engine = builder(Arc::new(MemoryFlowJournal::new()), Arc::new(AtomicU32::new(0))).build();
        let err = engine.start_flow("Nope", "x", json!(null)).await.unwrap_err();
        assert_eq!(err, BridgeError::UnknownFlow("Nope".into()));
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes() {
        let calls = Arc::new(AtomicU32::new(0));
        let journal = Arc::new(MemoryFlowJournal::new());
        let run = journal
            .create_flow("interrupted", "Twice", Q, &json!(2))
            .await
            .unwrap();
        // A previous process claimed it and died
        journal.claim_next(Q).await.unwrap();

        let engine = builder(journal, calls).build();
        let _shutdown = start(&engine);
        let handle = FlowHandle {
            flow_id: "interrupted".into(),
            run_id: run.run_id,
        };
        assert_eq!(result_of(&engine, &handle).await.unwrap(), json!(8));
    }
}
