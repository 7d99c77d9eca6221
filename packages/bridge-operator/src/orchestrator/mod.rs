//! Bridge orchestrator
//!
//! A persistent task queue with checkpointing. Flows are async functions over
//! a [`FlowContext`]; every activity they run is journaled by sequence number
//! so a run resumed after a crash replays recorded outcomes instead of
//! repeating side effects.
//!
//! - [`journal`] - the `FlowJournal` trait and its in-memory store
//! - [`pg_journal`] - the Postgres journal
//! - [`engine`] - queues, dispatch, replay and retries
//! - [`activities`] - the named ledger, claim and chain activities
//! - [`flows`] - claim, treasury cash-in and governance flows

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::BridgeResult;

pub mod activities;
pub mod engine;
pub mod flows;
pub mod journal;
pub mod pg_journal;
pub mod retry;

pub use engine::{EngineBuilder, FlowContext, FlowEngine};
pub use journal::{FlowJournal, FlowRecord, MemoryFlowJournal, StepOutcome, StepRecord};
pub use pg_journal::PgFlowJournal;
pub use retry::{ActivityClass, RetryPolicy};

/// Task queue for claim and cash-in flows.
pub const BRIDGE_QUEUE: &str = "bridge-weleth";
/// Task queue for administrative chain operations.
pub const GOVERNANCE_QUEUE: &str = "bridge-governance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl FlowStatus {
    pub const ALL: [FlowStatus; 5] = [
        FlowStatus::Scheduled,
        FlowStatus::Running,
        FlowStatus::Completed,
        FlowStatus::Failed,
        FlowStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Scheduled => "scheduled",
            FlowStatus::Running => "running",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Canceled => "canceled",
        }
    }

    /// Scheduled or running.
    pub fn is_open(&self) -> bool {
        matches!(self, FlowStatus::Scheduled | FlowStatus::Running)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies one run of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowHandle {
    pub flow_id: String,
    pub run_id: i64,
}

/// The durable task execution capability flows are started through.
#[async_trait]
pub trait Orchestration: Send + Sync {
    /// Schedule a new run. Fails with `FlowAlreadyRunning` while a run with
    /// the same id is open.
    async fn start_flow(
        &self,
        flow_type: &str,
        flow_id: &str,
        input: Value,
    ) -> BridgeResult<FlowHandle>;

    /// Deliver a named signal to the open run of `flow_id`. Buffered until
    /// the flow waits for it.
    async fn signal_flow(&self, flow_id: &str, signal: &str, payload: Value) -> BridgeResult<()>;

    /// Request cooperative cancellation of the open run of `flow_id`.
    async fn cancel_flow(&self, flow_id: &str) -> BridgeResult<()>;

    /// Wait for the run to finish; its terminal error is returned as is.
    async fn flow_result(&self, handle: &FlowHandle) -> BridgeResult<Value>;

    /// Wait until the run publishes progress or finishes, whichever is first.
    async fn flow_progress(&self, handle: &FlowHandle) -> BridgeResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_status_open() {
        assert!(FlowStatus::Scheduled.is_open());
        assert!(FlowStatus::Running.is_open());
        assert!(!FlowStatus::Completed.is_open());
        assert!(!FlowStatus::Canceled.is_open());
        assert_eq!(FlowStatus::Failed.to_string(), "failed");
    }
}
