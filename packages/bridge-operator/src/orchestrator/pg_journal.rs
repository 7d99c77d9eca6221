//! Postgres flow journal
//!
//! Workers claim runs with `FOR UPDATE SKIP LOCKED` so several processes can
//! share one task queue. The open-run uniqueness of a flow id is enforced by
//! a partial unique index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tracing::debug;

use super::journal::{signal_outcome, signal_step_name, FlowJournal, FlowRecord, StepOutcome, StepRecord};
use super::FlowStatus;
use crate::error::{BridgeError, BridgeResult};

const RUN_COLUMNS: &str = "run_id, flow_id, flow_type, queue, status, input, output, error, \
    progress, cancel_requested, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct FlowRow {
    run_id: i64,
    flow_id: String,
    flow_type: String,
    queue: String,
    status: FlowStatus,
    input: Json<Value>,
    output: Option<Json<Value>>,
    error: Option<Json<BridgeError>>,
    progress: Option<Json<Value>>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FlowRow> for FlowRecord {
    fn from(row: FlowRow) -> Self {
        FlowRecord {
            run_id: row.run_id,
            flow_id: row.flow_id,
            flow_type: row.flow_type,
            queue: row.queue,
            status: row.status,
            input: row.input.0,
            output: row.output.map(|j| j.0),
            error: row.error.map(|j| j.0),
            progress: row.progress.map(|j| j.0),
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PgFlowJournal {
    pool: PgPool,
}

impl PgFlowJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowJournal for PgFlowJournal {
    async fn create_flow(
        &self,
        flow_id: &str,
        flow_type: &str,
        queue: &str,
        input: &Value,
    ) -> BridgeResult<FlowRecord> {
        let row: FlowRow = sqlx::query_as(&format!(
            "INSERT INTO flow_runs (flow_id, flow_type, queue, input) VALUES ($1, $2, $3, $4) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(flow_id)
        .bind(flow_type)
        .bind(queue)
        .bind(Json(input))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BridgeError::FlowAlreadyRunning(flow_id.to_string())
            }
            _ => e.into(),
        })?;

        debug!(run_id = row.run_id, flow_id, flow_type, queue, "Flow run scheduled");
        Ok(row.into())
    }

    async fn claim_next(&self, queue: &str) -> BridgeResult<Option<FlowRecord>> {
        let row: Option<FlowRow> = sqlx::query_as(&format!(
            r#"
            UPDATE flow_runs SET status = 'running', updated_at = NOW()
            WHERE run_id = (
                SELECT run_id FROM flow_runs
                WHERE queue = $1 AND status = 'scheduled'
                ORDER BY run_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn finish_flow(
        &self,
        run_id: i64,
        status: FlowStatus,
        output: Option<&Value>,
        error: Option<&BridgeError>,
    ) -> BridgeResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE flow_runs SET status = $2, output = $3, error = $4, updated_at = NOW()
            WHERE run_id = $1 AND status IN ('scheduled', 'running')
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(output.map(Json))
        .bind(error.map(Json))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && self.flow(run_id).await?.is_none() {
            return Err(BridgeError::NotFound(format!("flow run {run_id}")));
        }
        Ok(updated > 0)
    }

    async fn flow(&self, run_id: i64) -> BridgeResult<Option<FlowRecord>> {
        let row: Option<FlowRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM flow_runs WHERE run_id = $1"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    async fn open_run(&self, flow_id: &str) -> BridgeResult<Option<FlowRecord>> {
        let row: Option<FlowRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM flow_runs \
             WHERE flow_id = $1 AND status IN ('scheduled', 'running')"
        ))
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn request_cancel(&self, run_id: i64) -> BridgeResult<bool> {
        let updated = sqlx::query(
            "UPDATE flow_runs SET cancel_requested = TRUE, updated_at = NOW() \
             WHERE run_id = $1 AND status IN ('scheduled', 'running')",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn load_step(&self, run_id: i64, seq: i32) -> BridgeResult<Option<StepRecord>> {
        let row: Option<(String, Json<StepOutcome>)> =
            sqlx::query_as("SELECT name, outcome FROM flow_steps WHERE run_id = $1 AND seq = $2")
                .bind(run_id)
                .bind(seq)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(name, outcome)| StepRecord {
            run_id,
            seq,
            name,
            outcome: outcome.0,
        }))
    }

    async fn save_step(&self, step: &StepRecord) -> BridgeResult<()> {
        sqlx::query(
            "INSERT INTO flow_steps (run_id, seq, name, outcome) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (run_id, seq) DO NOTHING",
        )
        .bind(step.run_id)
        .bind(step.seq)
        .bind(&step.name)
        .bind(Json(&step.outcome))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn push_signal(&self, run_id: i64, name: &str, payload: &Value) -> BridgeResult<()> {
        sqlx::query("INSERT INTO flow_signals (run_id, name, payload) VALUES ($1, $2, $3)")
            .bind(run_id)
            .bind(name)
            .bind(Json(payload))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_signal(
        &self,
        run_id: i64,
        name: &str,
        seq: i32,
    ) -> BridgeResult<Option<Value>> {
        let mut tx = self.pool.begin().await?;

        let consumed: Option<(Json<Value>,)> = sqlx::query_as(
            r#"
            UPDATE flow_signals SET consumed = TRUE
            WHERE id = (
                SELECT id FROM flow_signals
                WHERE run_id = $1 AND name = $2 AND NOT consumed
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .bind(run_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((Json(payload),)) = consumed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let outcome = StepOutcome::Ok(signal_outcome(Some(payload.clone())));
        sqlx::query(
            "INSERT INTO flow_steps (run_id, seq, name, outcome) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (run_id, seq) DO NOTHING",
        )
        .bind(run_id)
        .bind(seq)
        .bind(signal_step_name(name))
        .bind(Json(&outcome))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(payload))
    }

    async fn set_progress(&self, run_id: i64, progress: &Value) -> BridgeResult<()> {
        let updated = sqlx::query(
            "UPDATE flow_runs SET progress = $2, updated_at = NOW() WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(Json(progress))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(BridgeError::NotFound(format!("flow run {run_id}")));
        }
        Ok(())
    }

    async fn requeue_interrupted(&self) -> BridgeResult<u64> {
        let requeued = sqlx::query(
            "UPDATE flow_runs SET status = 'scheduled', updated_at = NOW() WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(requeued)
    }

    async fn count_by_status(&self) -> BridgeResult<Vec<(FlowStatus, i64)>> {
        let rows: Vec<(FlowStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM flow_runs GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}
