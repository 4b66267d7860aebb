//! Canonical data model for arqueo tasks.
//!
//! Everything here is a plain serde type shared across the workspace: the
//! normalized request, the line items that compose it, the operation result
//! published back to the broker, and the fixed-point cent representation used
//! for every monetary amount. Parsing and validation of raw payloads live in
//! `arq-normalize`; this crate owns only the canonical shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod cents;

pub use cents::Cents;

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a single arqueo task.
///
/// `Completed`, `Incompleted` and `Failed` are terminal: no transition ever
/// leaves them. `Incompleted` means the external ledger holds a partial but
/// not-rollbackable operation (or the totals did not reconcile) — it is NOT a
/// retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Incompleted,
    Failed,
}

impl OperationStatus {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Incompleted | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Incompleted => "INCOMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "INCOMPLETED" => Some(Self::Incompleted),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Naturaleza
// ---------------------------------------------------------------------------

/// Operation nature. SICAL encodes expenses as `"4"` and income as `"5"`;
/// both the symbolic names and the numeric codes are accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Naturaleza {
    Income,
    Expense,
}

impl Naturaleza {
    /// The code keyed into the ledger application's nature field.
    pub fn ledger_code(&self) -> &'static str {
        match self {
            Self::Income => "5",
            Self::Expense => "4",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INCOME" | "5" => Some(Self::Income),
            "EXPENSE" | "4" => Some(Self::Expense),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Committed (contraído)
// ---------------------------------------------------------------------------

/// The `contraido` flag of a line item.
///
/// Closed set of representations: a boolean flag, or an integer surrogate
/// (a 7-digit contraído operation reference). The coercion from raw JSON —
/// including the float 0.0/1.0 fallback — is performed by `arq-normalize`;
/// by the time a value is of this type it is already canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Committed {
    Flag(bool),
    Reference(i64),
}

impl Committed {
    /// Whether the amount is budget-committed at all (drives keying paths
    /// in the ledger automation). A zero reference — produced by the float
    /// `0.0` fallback — counts as not committed.
    pub fn is_set(&self) -> bool {
        match self {
            Self::Flag(b) => *b,
            Self::Reference(n) => *n != 0,
        }
    }
}

impl Default for Committed {
    fn default() -> Self {
        Self::Flag(false)
    }
}

// ---------------------------------------------------------------------------
// LineItem (aplicación)
// ---------------------------------------------------------------------------

/// One budget-line entry (aplicación) of an arqueo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// 4-digit budget year.
    pub year: String,
    /// Municipal budget line identifier (económica).
    pub budget_code: String,
    /// Optional affected-financing project code.
    pub project_code: Option<String>,
    pub committed: Committed,
    /// Taxable base in cents. Defaults to 0 when absent on the wire.
    pub taxable_base: Cents,
    /// Tax rate in basis-hundredths. Defaults to 0 when absent on the wire.
    pub rate: Cents,
    /// Line amount in cents. Required and exact.
    pub amount: Cents,
    /// Optional general-ledger plan account override.
    pub pgp_account: Option<String>,
    /// PGC account derived from the budget-code map; `"000"` when unmapped.
    pub account: String,
}

// ---------------------------------------------------------------------------
// OperationDetail / OperationRequest
// ---------------------------------------------------------------------------

/// The normalized body of an arqueo operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDetail {
    /// Operation date, `ddmmyyyy`.
    pub fecha: String,
    /// Cash-register (caja) code identifying the till.
    pub caja: String,
    /// Expediente reference; defaulted when absent on the wire.
    pub expediente: String,
    /// Third-party (tercero) identifier.
    pub tercero: String,
    pub naturaleza: Naturaleza,
    /// Free text extracted from the `texto_sical` descriptive block.
    pub description: String,
    pub line_items: Vec<LineItem>,
    /// Discount rows; usually empty, carried through untouched.
    #[serde(default)]
    pub discounts: Vec<Value>,
    /// Opaque auxiliary data, passthrough.
    #[serde(default)]
    pub aux_data: BTreeMap<String, Value>,
    /// Timestamp the request was generated by the upstream system.
    pub generated_at: Option<DateTime<Utc>>,
}

impl OperationDetail {
    /// Exact sum of all line-item amounts, in cents.
    pub fn line_item_total(&self) -> Cents {
        self.line_items.iter().map(|li| li.amount).sum()
    }
}

/// A fully normalized task request: correlation key + operation body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Correlation key end-to-end: input message → published result → audit
    /// row. Unique only among in-flight tasks, not globally.
    pub task_id: String,
    pub detail: OperationDetail,
    /// Declared total of the whole operation, when the caller supplies one.
    pub declared_total: Option<Cents>,
}

// ---------------------------------------------------------------------------
// OperationResult
// ---------------------------------------------------------------------------

/// Outcome of driving one arqueo task through the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub init_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds.
    pub duration_secs: Option<f64>,
    /// Operation number assigned by the ledger on confirmation.
    pub assigned_operation_number: Option<String>,
    pub declared_total: Option<Cents>,
    /// Exact cent sum of every submitted line item.
    pub computed_sum: Cents,
    pub ledger_open: bool,
    pub error: Option<String>,
}

impl OperationResult {
    /// A fresh result at task start: `Pending`, ledger closed, zero sum.
    pub fn started_at(init_time: DateTime<Utc>) -> Self {
        Self {
            status: OperationStatus::Pending,
            init_time,
            end_time: None,
            duration_secs: None,
            assigned_operation_number: None,
            declared_total: None,
            computed_sum: Cents::ZERO,
            ledger_open: false,
            error: None,
        }
    }

    /// Stamp the end time and derive the duration.
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        let micros = end_time
            .signed_duration_since(self.init_time)
            .num_microseconds()
            .unwrap_or(0);
        self.duration_secs = Some(micros as f64 / 1_000_000.0);
    }
}

// ---------------------------------------------------------------------------
// ResultEnvelope — wire shape published to the results queue
// ---------------------------------------------------------------------------

/// Body published on the fixed results queue. `operation_id` mirrors the
/// originating `task_id`; the message's `correlation_id` property carries it
/// too so consumers can filter without parsing the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: OperationStatus,
    pub operation_id: String,
    pub result: OperationResult,
}

impl ResultEnvelope {
    pub fn new(task_id: &str, result: OperationResult) -> Self {
        Self {
            status: result.status,
            operation_id: task_id.to_string(),
            result,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Incompleted.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_roundtrips_through_str() {
        for s in [
            OperationStatus::Pending,
            OperationStatus::InProgress,
            OperationStatus::Completed,
            OperationStatus::Incompleted,
            OperationStatus::Failed,
        ] {
            assert_eq!(OperationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OperationStatus::parse("DONE"), None);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let j = serde_json::to_string(&OperationStatus::InProgress).unwrap();
        assert_eq!(j, "\"IN_PROGRESS\"");
    }

    #[test]
    fn naturaleza_accepts_names_and_sical_codes() {
        assert_eq!(Naturaleza::parse("INCOME"), Some(Naturaleza::Income));
        assert_eq!(Naturaleza::parse("5"), Some(Naturaleza::Income));
        assert_eq!(Naturaleza::parse("EXPENSE"), Some(Naturaleza::Expense));
        assert_eq!(Naturaleza::parse("4"), Some(Naturaleza::Expense));
        assert_eq!(Naturaleza::parse("6"), None);
        assert_eq!(Naturaleza::Income.ledger_code(), "5");
        assert_eq!(Naturaleza::Expense.ledger_code(), "4");
    }

    #[test]
    fn committed_reference_counts_as_set() {
        assert!(Committed::Reference(2_500_046).is_set());
        assert!(Committed::Flag(true).is_set());
        assert!(!Committed::Flag(false).is_set());
    }

    #[test]
    fn committed_serializes_untagged() {
        assert_eq!(serde_json::to_string(&Committed::Flag(true)).unwrap(), "true");
        assert_eq!(
            serde_json::to_string(&Committed::Reference(2_500_046)).unwrap(),
            "2500046"
        );
    }

    #[test]
    fn result_finalize_computes_duration() {
        let t0 = Utc::now();
        let mut r = OperationResult::started_at(t0);
        r.finalize(t0 + chrono::Duration::milliseconds(1500));
        assert_eq!(r.duration_secs, Some(1.5));
        assert!(r.end_time.is_some());
    }

    #[test]
    fn envelope_mirrors_task_id_and_status() {
        let mut r = OperationResult::started_at(Utc::now());
        r.status = OperationStatus::Completed;
        let env = ResultEnvelope::new("204_08112024_5000_MPTOST", r);
        assert_eq!(env.operation_id, "204_08112024_5000_MPTOST");
        assert_eq!(env.status, OperationStatus::Completed);
    }
}
