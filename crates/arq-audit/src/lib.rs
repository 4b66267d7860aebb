//! Append-only audit store for processed arqueo tasks.
//!
//! One row per task, written exactly once when the task reaches a terminal
//! status. Rows are never updated or deleted; replayed deliveries are
//! answered from the existing row. The raw inbound payload is stored next to
//! the outcome together with its SHA-256, so any result can be traced back
//! to the exact message that produced it.
//!
//! Backed by SQLite in WAL mode; the daemon's history endpoint and the
//! export module read from the same pool.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use arq_schemas::{Cents, OperationStatus};

pub mod export;

// ---------------------------------------------------------------------------
// Pool setup
// ---------------------------------------------------------------------------

/// Open (creating if missing) the audit database at `path`.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open audit db {:?}", path.as_ref()))?;

    Ok(pool)
}

/// In-memory database for tests.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory audit db")?;
    Ok(pool)
}

/// Create the schema if it does not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        create table if not exists tasks (
          task_id                    text primary key,
          status                     text not null,
          init_time                  text not null,
          end_time                   text not null,
          duration_secs              real not null,
          assigned_operation_number  text,
          declared_total_cents       integer,
          computed_sum_cents         integer not null,
          error                      text,
          raw_payload                text not null,
          payload_sha256             text not null,
          recorded_at                text not null
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create tasks table failed")?;

    sqlx::query("create index if not exists idx_tasks_status on tasks (status)")
        .execute(pool)
        .await
        .context("create status index failed")?;
    sqlx::query("create index if not exists idx_tasks_recorded_at on tasks (recorded_at)")
        .execute(pool)
        .await
        .context("create recorded_at index failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// TaskRecord
// ---------------------------------------------------------------------------

/// One audited task outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: OperationStatus,
    pub init_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub assigned_operation_number: Option<String>,
    pub declared_total: Option<Cents>,
    pub computed_sum: Cents,
    pub error: Option<String>,
    /// Raw inbound message, verbatim.
    pub raw_payload: Value,
    /// Hex SHA-256 of the raw payload text.
    pub payload_sha256: String,
    pub recorded_at: DateTime<Utc>,
}

/// Hex SHA-256 of the raw message body as received.
pub fn payload_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

/// Append-only view over the tasks table.
#[derive(Clone)]
pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a record unless one already exists for the same task_id.
    ///
    /// Returns `true` when the row was written, `false` when a previous
    /// delivery already recorded this task (the stored outcome wins).
    pub async fn insert_once(&self, record: &TaskRecord) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert or ignore into tasks (
              task_id, status, init_time, end_time, duration_secs,
              assigned_operation_number, declared_total_cents,
              computed_sum_cents, error, raw_payload, payload_sha256,
              recorded_at
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.task_id)
        .bind(record.status.as_str())
        .bind(record.init_time)
        .bind(record.end_time)
        .bind(record.duration_secs)
        .bind(&record.assigned_operation_number)
        .bind(record.declared_total.map(|c| c.0))
        .bind(record.computed_sum.0)
        .bind(&record.error)
        .bind(record.raw_payload.to_string())
        .bind(&record.payload_sha256)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .context("insert task record failed")?;

        Ok(res.rows_affected() == 1)
    }

    /// Fetch the stored outcome for a task, if any.
    pub async fn find_by_task_id(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("select * from tasks where task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("find_by_task_id failed")?;

        row.map(record_from_row).transpose()
    }

    /// Query records by status, recording window, and free text.
    ///
    /// Free text matches task_id, error, and operation number. Results come
    /// back newest first.
    pub async fn query(&self, filter: &TaskQuery) -> Result<Vec<TaskRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("select * from tasks where 1=1");

        if let Some(status) = filter.status {
            qb.push(" and status = ").push_bind(status.as_str());
        }
        if let Some(from) = filter.from {
            qb.push(" and recorded_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" and recorded_at <= ").push_bind(to);
        }
        if let Some(text) = &filter.text {
            let like = format!("%{text}%");
            qb.push(" and (task_id like ")
                .push_bind(like.clone())
                .push(" or error like ")
                .push_bind(like.clone())
                .push(" or assigned_operation_number like ")
                .push_bind(like)
                .push(")");
        }

        qb.push(" order by recorded_at desc");
        qb.push(" limit ").push_bind(filter.limit.unwrap_or(500));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("task query failed")?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Terminal-status counts over the whole table.
    pub async fn stats(&self) -> Result<AuditStats> {
        let rows = sqlx::query("select status, count(*) as n from tasks group by status")
            .fetch_all(&self.pool)
            .await
            .context("stats query failed")?;

        let mut stats = AuditStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status = OperationStatus::parse(&status)
                .with_context(|| format!("unknown status in tasks table: {status}"))?;
            match status {
                OperationStatus::Completed => stats.completed = n,
                OperationStatus::Incompleted => stats.incompleted = n,
                OperationStatus::Failed => stats.failed = n,
                OperationStatus::Pending | OperationStatus::InProgress => {}
            }
        }
        Ok(stats)
    }
}

/// Filter for [`AuditStore::query`]. Empty filter returns the latest rows.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<OperationStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub completed: i64,
    pub incompleted: i64,
    pub failed: i64,
}

impl AuditStats {
    pub fn total(&self) -> i64 {
        self.completed + self.incompleted + self.failed
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let status: String = row.try_get("status")?;
    let raw: String = row.try_get("raw_payload")?;
    Ok(TaskRecord {
        task_id: row.try_get("task_id")?,
        status: OperationStatus::parse(&status)
            .with_context(|| format!("unknown status in tasks table: {status}"))?,
        init_time: row.try_get("init_time")?,
        end_time: row.try_get("end_time")?,
        duration_secs: row.try_get("duration_secs")?,
        assigned_operation_number: row.try_get("assigned_operation_number")?,
        declared_total: row
            .try_get::<Option<i64>, _>("declared_total_cents")?
            .map(Cents),
        computed_sum: Cents(row.try_get("computed_sum_cents")?),
        error: row.try_get("error")?,
        raw_payload: serde_json::from_str(&raw).context("stored raw_payload not JSON")?,
        payload_sha256: row.try_get("payload_sha256")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
