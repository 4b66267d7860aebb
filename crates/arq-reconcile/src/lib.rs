//! Amount reconciliation for arqueo tasks.
//!
//! Compares the computed line-item sum against the caller-declared total.
//! This is pure classification: it never errors and never mutates anything.
//! The orchestrator maps [`ReconcileOutcome::Mismatch`] to the
//! `INCOMPLETED` terminal status with the report's note in the result error
//! field.

use arq_schemas::Cents;
use serde::{Deserialize, Serialize};

/// Tolerance absorbed by the comparison, in cents.
///
/// Covers currency rounding at the declaring side (totals arrive with at
/// most two decimals), not floating-point noise — amounts are integer cents
/// end to end, so there is none.
pub const TOLERANCE_CENTS: i64 = 1;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Outcome of reconciling one task's totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    /// Totals agree (or there was no declared total to verify).
    Match,
    /// Totals disagree beyond tolerance.
    Mismatch,
}

/// Deterministic reconciliation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub computed_sum: Cents,
    pub declared_total: Option<Cents>,
    /// Human-readable mismatch description; `None` on a clean report.
    pub note: Option<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.outcome == ReconcileOutcome::Match
    }

    fn clean(computed_sum: Cents, declared_total: Option<Cents>) -> Self {
        Self {
            outcome: ReconcileOutcome::Match,
            computed_sum,
            declared_total,
            note: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Reconcile the computed sum against an optional declared total.
///
/// - No declared total → trivially clean: there is no claim to verify.
/// - Declared total present → exact cent comparison within
///   [`TOLERANCE_CENTS`]; a mismatch carries both values and the delta in
///   the note.
pub fn reconcile(computed_sum: Cents, declared_total: Option<Cents>) -> ReconcileReport {
    let Some(declared) = declared_total else {
        return ReconcileReport::clean(computed_sum, None);
    };

    let delta = computed_sum.abs_delta(declared);
    if delta.0 <= TOLERANCE_CENTS {
        return ReconcileReport::clean(computed_sum, Some(declared));
    }

    ReconcileReport {
        outcome: ReconcileOutcome::Mismatch,
        computed_sum,
        declared_total: Some(declared),
        note: Some(format!(
            "reconciliation mismatch: declared total {declared} != computed sum \
             {computed_sum} (delta {delta})"
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_declared_total_passes_trivially() {
        let r = reconcile(Cents(500_000), None);
        assert!(r.is_clean());
        assert_eq!(r.note, None);
        assert_eq!(r.declared_total, None);
    }

    #[test]
    fn exact_match_is_clean() {
        let r = reconcile(Cents(140_000), Some(Cents(140_000)));
        assert!(r.is_clean());
        assert_eq!(r.note, None);
    }

    #[test]
    fn one_cent_rounding_is_absorbed() {
        assert!(reconcile(Cents(140_001), Some(Cents(140_000))).is_clean());
        assert!(reconcile(Cents(139_999), Some(Cents(140_000))).is_clean());
    }

    #[test]
    fn two_cents_is_a_mismatch() {
        let r = reconcile(Cents(140_002), Some(Cents(140_000)));
        assert!(!r.is_clean());
    }

    #[test]
    fn mismatch_note_carries_both_values_and_delta() {
        // Scenario: items sum 1400.00, caller declared 1500.00.
        let r = reconcile(Cents(140_000), Some(Cents(150_000)));
        assert_eq!(r.outcome, ReconcileOutcome::Mismatch);
        let note = r.note.unwrap();
        assert!(note.contains("1500.00"), "{note}");
        assert!(note.contains("1400.00"), "{note}");
        assert!(note.contains("100.00"), "{note}");
    }

    #[test]
    fn comparison_is_symmetric() {
        let over = reconcile(Cents(150_000), Some(Cents(140_000)));
        let under = reconcile(Cents(140_000), Some(Cents(150_000)));
        assert!(!over.is_clean());
        assert!(!under.is_clean());
    }

    #[test]
    fn classification_never_panics_on_extremes() {
        let r = reconcile(Cents(i64::MAX / 2), Some(Cents(i64::MIN / 2)));
        assert!(!r.is_clean());
    }
}
