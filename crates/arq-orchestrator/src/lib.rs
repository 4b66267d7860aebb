//! Task orchestration: the state machine that drives one arqueo task from
//! raw message to terminal result.
//!
//! States: `PENDING → IN_PROGRESS → {COMPLETED, INCOMPLETED, FAILED}`. The
//! three end states are terminal; a task is classified exactly once.
//!
//! Sequence on dequeue:
//! 1. Normalize + validate. Failure → `FAILED`; the ledger is never touched.
//! 2. Open the ledger session. Failure → `FAILED` (connectivity message).
//! 3. Key the header, then each line item in input order, accumulating the
//!    computed sum. A failure after the first successful item leaves a
//!    partial, not-rollbackable operation in the ledger → `INCOMPLETED`.
//! 4. Confirm, capturing the assigned operation number. Failure here also
//!    leaves partial state → `INCOMPLETED`.
//! 5. Reconcile computed sum against the declared total. Mismatch →
//!    `INCOMPLETED` with the reconciliation note; match → `COMPLETED`.
//! 6. Stamp end time, write the audit row, emit the terminal status event.
//!
//! Classification never escapes as an error: every processable message
//! produces a result envelope. Only an unusable message (no `task_id`) or a
//! failed audit write propagate — the broker layer maps the former to
//! reject-without-requeue and the latter to redelivery.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use arq_audit::{payload_hash, AuditStore, TaskRecord};
use arq_ledger::{AutomationError, LedgerDriver};
use arq_normalize::{normalize, AccountMap};
use arq_reconcile::reconcile;
use arq_schemas::{OperationRequest, OperationResult, OperationStatus, ResultEnvelope};
use arq_status::StatusBroadcaster;

// ---------------------------------------------------------------------------
// Outcome / errors
// ---------------------------------------------------------------------------

/// How a delivery was resolved.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task was processed now; the envelope carries the fresh result.
    Processed(ResultEnvelope),
    /// A previous delivery already recorded this task; the stored outcome
    /// was replayed without touching the ledger.
    Replayed(ResultEnvelope),
}

impl TaskOutcome {
    pub fn envelope(&self) -> &ResultEnvelope {
        match self {
            TaskOutcome::Processed(env) | TaskOutcome::Replayed(env) => env,
        }
    }
}

/// A message that cannot enter the pipeline at all: no correlation key to
/// publish a result under. The broker rejects these without requeue.
#[derive(Debug)]
pub struct UnusableMessage(pub String);

impl std::fmt::Display for UnusableMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unusable message: {}", self.0)
    }
}

impl std::error::Error for UnusableMessage {}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

pub struct TaskOrchestrator<L: LedgerDriver> {
    ledger: L,
    accounts: AccountMap,
    audit: AuditStore,
    status: StatusBroadcaster,
}

impl<L: LedgerDriver> TaskOrchestrator<L> {
    pub fn new(ledger: L, accounts: AccountMap, audit: AuditStore, status: StatusBroadcaster) -> Self {
        Self {
            ledger,
            accounts,
            audit,
            status,
        }
    }

    /// The underlying ledger driver (used by tests and diagnostics).
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Process one raw delivery end to end.
    ///
    /// Returns the envelope to publish. `Err(UnusableMessage)` means the
    /// body had no extractable `task_id`; any other error is an audit-write
    /// failure, after which the delivery must NOT be acknowledged.
    pub async fn handle_raw(&mut self, raw: &str) -> Result<TaskOutcome> {
        let body: Value = serde_json::from_str(raw)
            .map_err(|e| UnusableMessage(format!("body is not JSON: {e}")))?;
        let task_id = body
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| UnusableMessage("missing task_id".to_string()))?
            .to_string();

        // At-least-once delivery: a redelivered task that already reached a
        // terminal state is answered from the audit row, never re-keyed.
        if let Some(record) = self.audit.find_by_task_id(&task_id).await? {
            info!(task_id, status = %record.status, "replaying stored outcome for redelivery");
            self.status
                .log("WARN", format!("task {task_id} redelivered; replaying stored outcome"));
            return Ok(TaskOutcome::Replayed(envelope_from_record(&record)));
        }

        self.status.task_received(&task_id);
        let mut result = OperationResult::started_at(Utc::now());

        match normalize(&body, &self.accounts) {
            Ok(request) => {
                result.declared_total = request.declared_total;
                self.drive_ledger(&request, &mut result).await;
            }
            Err(validation) => {
                warn!(task_id, error = %validation, "validation failed");
                result.status = OperationStatus::Failed;
                result.error = Some(validation.to_string());
            }
        }

        result.finalize(Utc::now());
        result.ledger_open = self.ledger.is_open();
        self.status.task_finished(&task_id, result.status);
        info!(
            task_id,
            status = %result.status,
            computed_sum = %result.computed_sum,
            "task reached terminal state"
        );

        self.record(&task_id, raw, &body, &result).await?;
        Ok(TaskOutcome::Processed(ResultEnvelope::new(&task_id, result)))
    }

    /// Steps 2–5: ledger session and reconciliation. Sets a terminal status
    /// on `result` in every path.
    async fn drive_ledger(&mut self, request: &OperationRequest, result: &mut OperationResult) {
        let task_id = &request.task_id;
        self.status.task_started(task_id);
        result.status = OperationStatus::InProgress;

        if let Err(err) = self.ledger.open().await {
            result.status = OperationStatus::Failed;
            result.error = Some(err.to_string());
            return;
        }

        // Header keyed before any item; a failure here leaves no partial
        // operation, so the task is still FAILED, not INCOMPLETED.
        if let Err(err) = self.ledger.submit_header(&request.detail).await {
            result.status = OperationStatus::Failed;
            result.error = Some(err.to_string());
            self.close_ledger(task_id).await;
            return;
        }

        let total = request.detail.line_items.len();
        for (index, item) in request.detail.line_items.iter().enumerate() {
            match self.ledger.submit_line_item(item).await {
                Ok(_confirmation) => {
                    result.computed_sum = result.computed_sum + item.amount;
                    self.status.item_submitted(task_id, index, total);
                }
                Err(err) => {
                    // Items already keyed cannot be rolled back through
                    // this interface.
                    result.status = OperationStatus::Incompleted;
                    result.error = Some(format!("item {index}: {err}"));
                    self.close_ledger(task_id).await;
                    return;
                }
            }
        }

        match self.ledger.confirm().await {
            Ok(outcome) => {
                result.assigned_operation_number = Some(outcome.assigned_operation_number);
            }
            Err(err) => {
                result.status = OperationStatus::Incompleted;
                result.error = Some(err.to_string());
                self.close_ledger(task_id).await;
                return;
            }
        }

        self.close_ledger(task_id).await;

        let report = reconcile(result.computed_sum, request.declared_total);
        if report.is_clean() {
            result.status = OperationStatus::Completed;
        } else {
            result.status = OperationStatus::Incompleted;
            result.error = report.note;
        }
    }

    /// Best-effort close; a close failure is logged, never reclassifies.
    async fn close_ledger(&mut self, task_id: &str) {
        if let Err(err) = self.ledger.close().await {
            warn!(task_id, error = %err, "ledger close failed");
            self.status
                .log("WARN", format!("task {task_id}: ledger close failed: {err}"));
        }
    }

    /// The single audit write for this task. Append-only: if a row already
    /// exists (lost race with a redelivery) the stored row wins.
    async fn record(
        &self,
        task_id: &str,
        raw: &str,
        body: &Value,
        result: &OperationResult,
    ) -> Result<()> {
        let now = Utc::now();
        let record = TaskRecord {
            task_id: task_id.to_string(),
            status: result.status,
            init_time: result.init_time,
            end_time: result.end_time.unwrap_or(now),
            duration_secs: result.duration_secs.unwrap_or(0.0),
            assigned_operation_number: result.assigned_operation_number.clone(),
            declared_total: result.declared_total,
            computed_sum: result.computed_sum,
            error: result.error.clone(),
            raw_payload: body.clone(),
            payload_sha256: payload_hash(raw),
            recorded_at: now,
        };
        let inserted = self
            .audit
            .insert_once(&record)
            .await
            .with_context(|| format!("audit write for task {task_id}"))?;
        if !inserted {
            warn!(task_id, "audit row already present; keeping stored outcome");
        }
        Ok(())
    }
}

/// Rebuild the publishable envelope from a stored audit row.
fn envelope_from_record(record: &TaskRecord) -> ResultEnvelope {
    let result = OperationResult {
        status: record.status,
        init_time: record.init_time,
        end_time: Some(record.end_time),
        duration_secs: Some(record.duration_secs),
        assigned_operation_number: record.assigned_operation_number.clone(),
        declared_total: record.declared_total,
        computed_sum: record.computed_sum,
        ledger_open: false,
        error: record.error.clone(),
    };
    ResultEnvelope::new(&record.task_id, result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use arq_testkit::{raw_task, ScriptedLedger, LedgerScript};
    use arq_schemas::Cents;

    async fn orchestrator(script: LedgerScript) -> TaskOrchestrator<ScriptedLedger> {
        let pool = arq_audit::connect_in_memory().await.unwrap();
        arq_audit::init_schema(&pool).await.unwrap();
        TaskOrchestrator::new(
            ScriptedLedger::new(script),
            AccountMap::from_pairs([("130", "727")]),
            AuditStore::new(pool),
            StatusBroadcaster::new(),
        )
    }

    fn processed(outcome: TaskOutcome) -> ResultEnvelope {
        match outcome {
            TaskOutcome::Processed(env) => env,
            TaskOutcome::Replayed(env) => panic!("unexpected replay: {env:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_completes_with_operation_number() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let raw = raw_task("t-1", &[("130", "5000.00"), ("300", "250.50")], Some("5250.50"));

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Completed);
        assert_eq!(env.operation_id, "t-1");
        assert_eq!(env.result.computed_sum, Cents(525_050));
        assert_eq!(env.result.assigned_operation_number.as_deref(), Some("220000001"));
        assert!(!env.result.ledger_open);
        assert!(env.result.error.is_none());
        assert!(env.result.duration_secs.is_some());
    }

    #[tokio::test]
    async fn validation_failure_never_touches_ledger() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let mut raw = raw_task("t-bad", &[("130", "100.00")], None);
        raw["detail"]["aplicaciones"][0]
            .as_object_mut()
            .unwrap()
            .remove("importe");

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Failed);
        assert!(env.result.error.as_deref().unwrap().contains("importe"));
        assert!(orch.ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn legacy_schema_is_rejected_not_translated() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let mut raw = raw_task("t-legacy", &[("130", "100.00")], None);
        raw["detail"]["aplicaciones"][0]["partida"] = serde_json::json!("130");
        raw["detail"]["aplicaciones"][0]["IMPORTE_PARTIDA"] = serde_json::json!("100.00");

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Failed);
        assert!(orch.ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn open_failure_is_failed_with_connectivity_message() {
        let mut orch = orchestrator(LedgerScript::FailOpen).await;
        let raw = raw_task("t-2", &[("130", "100.00")], None);

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Failed);
        assert!(env
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("session unavailable"));
        assert_eq!(env.result.computed_sum, Cents::ZERO);
    }

    #[tokio::test]
    async fn header_failure_is_failed_with_no_partial_state() {
        let mut orch = orchestrator(LedgerScript::FailHeader).await;
        let raw = raw_task("t-hdr", &[("130", "100.00"), ("300", "200.00")], None);

        // No item was keyed yet, so this is FAILED, not INCOMPLETED.
        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Failed);
        assert_eq!(env.result.computed_sum, Cents::ZERO);
        assert!(env.result.error.as_deref().unwrap().contains("submit_header"));
        assert!(env.result.assigned_operation_number.is_none());
        assert!(!env.result.ledger_open);
    }

    #[tokio::test]
    async fn mid_submission_failure_is_incompleted_with_partial_sum() {
        let mut orch = orchestrator(LedgerScript::FailAtItem(1)).await;
        let raw = raw_task(
            "t-3",
            &[("130", "100.00"), ("300", "200.00"), ("301", "300.00")],
            None,
        );

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Incompleted);
        // Only the first item was keyed before the abort.
        assert_eq!(env.result.computed_sum, Cents(10_000));
        assert!(env.result.error.as_deref().unwrap().contains("item 1"));
        assert!(env.result.assigned_operation_number.is_none());
    }

    #[tokio::test]
    async fn confirm_failure_is_incompleted() {
        let mut orch = orchestrator(LedgerScript::FailConfirm).await;
        let raw = raw_task("t-4", &[("130", "100.00")], None);

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Incompleted);
        assert_eq!(env.result.computed_sum, Cents(10_000));
    }

    #[tokio::test]
    async fn reconciliation_mismatch_is_incompleted_with_note() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let raw = raw_task("t-5", &[("130", "700.00"), ("300", "700.00")], Some("1500.00"));

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Incompleted);
        let note = env.result.error.as_deref().unwrap();
        assert!(note.contains("1500.00"), "{note}");
        assert!(note.contains("1400.00"), "{note}");
        // The ledger operation itself went through.
        assert!(env.result.assigned_operation_number.is_some());
    }

    #[tokio::test]
    async fn absent_declared_total_reconciles_trivially() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let raw = raw_task("t-6", &[("130", "100.00")], None);

        let env = processed(orch.handle_raw(&raw.to_string()).await.unwrap());
        assert_eq!(env.status, OperationStatus::Completed);
        assert!(env.result.declared_total.is_none());
    }

    #[tokio::test]
    async fn redelivery_replays_stored_outcome_without_ledger() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let raw = raw_task("t-7", &[("130", "100.00")], None).to_string();

        let first = processed(orch.handle_raw(&raw).await.unwrap());
        assert_eq!(first.status, OperationStatus::Completed);
        let calls_after_first = orch.ledger.calls().len();

        let second = orch.handle_raw(&raw).await.unwrap();
        let TaskOutcome::Replayed(env) = second else {
            panic!("expected replay");
        };
        assert_eq!(env.status, OperationStatus::Completed);
        assert_eq!(env.operation_id, "t-7");
        assert_eq!(
            env.result.assigned_operation_number,
            first.result.assigned_operation_number
        );
        assert_eq!(orch.ledger.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn terminal_task_writes_exactly_one_audit_row() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let raw = raw_task("t-8", &[("130", "100.00")], None).to_string();
        orch.handle_raw(&raw).await.unwrap();
        orch.handle_raw(&raw).await.unwrap();

        let rows = orch.audit.query(&Default::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, "t-8");
        assert_eq!(rows[0].payload_sha256, payload_hash(&raw));
    }

    #[tokio::test]
    async fn message_without_task_id_is_unusable() {
        let mut orch = orchestrator(LedgerScript::Succeed).await;
        let err = orch.handle_raw(r#"{"detail": {}}"#).await.unwrap_err();
        assert!(err.downcast_ref::<UnusableMessage>().is_some());

        let err = orch.handle_raw("not json at all").await.unwrap_err();
        assert!(err.downcast_ref::<UnusableMessage>().is_some());
    }

    #[tokio::test]
    async fn status_counters_reflect_terminal_outcomes() {
        let mut orch = orchestrator(LedgerScript::FailOpen).await;
        let raw = raw_task("t-9", &[("130", "100.00")], None).to_string();
        orch.handle_raw(&raw).await.unwrap();

        let snap = orch.status.snapshot();
        assert_eq!(snap.counters.failed, 1);
        assert_eq!(snap.counters.total(), 1);
        assert!(snap.current_task.is_none());
    }
}
