//! Deterministic test doubles and payload builders for the arqueo engine.
//!
//! No randomness, no network I/O. [`ScriptedLedger`] stands in for the
//! external ledger session with scripted fault injection; the builders
//! produce wire-shape task messages and normalized requests for tests.

use serde_json::{json, Value};

use arq_ledger::{AutomationError, ConfirmOutcome, ItemConfirmation, LedgerDriver};
use arq_schemas::{
    Cents, Committed, LineItem, Naturaleza, OperationDetail, OperationRequest,
};

// ---------------------------------------------------------------------------
// ScriptedLedger
// ---------------------------------------------------------------------------

/// Where the scripted ledger should fail, if anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LedgerScript {
    /// Every call succeeds.
    #[default]
    Succeed,
    /// `open` fails; the session never exists.
    FailOpen,
    /// `submit_header` fails after a successful open.
    FailHeader,
    /// `submit_line_item` fails on the item with this zero-based index.
    FailAtItem(usize),
    /// `confirm` fails after all items were keyed.
    FailConfirm,
}

/// Scripted ledger driver with a recorded call log.
///
/// Maintains running counters for deterministic operation numbers
/// ("220000001", "220000002", ...).
pub struct ScriptedLedger {
    script: LedgerScript,
    open: bool,
    items_seen: usize,
    next_operation_number: u64,
    running_total: Cents,
    calls: Vec<String>,
}

impl Default for ScriptedLedger {
    fn default() -> Self {
        Self::new(LedgerScript::Succeed)
    }
}

impl ScriptedLedger {
    pub fn new(script: LedgerScript) -> Self {
        Self {
            script,
            open: false,
            items_seen: 0,
            next_operation_number: 1,
            running_total: Cents(0),
            calls: Vec::new(),
        }
    }

    /// Ordered log of every driver call made, e.g. `["open", "submit_header",
    /// "submit_line_item", "confirm", "close"]`.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    /// Items successfully keyed into the session.
    pub fn items_submitted(&self) -> usize {
        self.items_seen
    }
}

impl LedgerDriver for ScriptedLedger {
    async fn open(&mut self) -> Result<(), AutomationError> {
        self.calls.push("open".to_string());
        if self.script == LedgerScript::FailOpen {
            return Err(AutomationError::Unavailable(
                "scripted: session unreachable".to_string(),
            ));
        }
        self.open = true;
        self.items_seen = 0;
        self.running_total = Cents(0);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn submit_header(&mut self, _detail: &OperationDetail) -> Result<(), AutomationError> {
        self.calls.push("submit_header".to_string());
        if self.script == LedgerScript::FailHeader {
            return Err(AutomationError::StepFailed {
                step: "submit_header",
                reason: "scripted: header rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn submit_line_item(
        &mut self,
        item: &LineItem,
    ) -> Result<ItemConfirmation, AutomationError> {
        self.calls.push("submit_line_item".to_string());
        if self.script == LedgerScript::FailAtItem(self.items_seen) {
            return Err(AutomationError::StepFailed {
                step: "submit_line_item",
                reason: format!("scripted: item {} rejected", self.items_seen),
            });
        }
        self.items_seen += 1;
        self.running_total = self.running_total + item.amount;
        Ok(ItemConfirmation {
            ledger_total: Some(self.running_total),
        })
    }

    async fn confirm(&mut self) -> Result<ConfirmOutcome, AutomationError> {
        self.calls.push("confirm".to_string());
        if self.script == LedgerScript::FailConfirm {
            return Err(AutomationError::StepFailed {
                step: "confirm",
                reason: "scripted: validation rejected".to_string(),
            });
        }
        let n = self.next_operation_number;
        self.next_operation_number += 1;
        Ok(ConfirmOutcome {
            assigned_operation_number: format!("2200{n:05}"),
        })
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        self.calls.push("close".to_string());
        self.open = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

/// Wire-shape line item as the upstream generator sends it.
pub fn raw_line_item(economica: &str, importe: &str) -> Value {
    json!({
        "year": "2024",
        "economica": economica,
        "proyecto": "",
        "contraido": false,
        "base_imponible": "0",
        "tipo": "0",
        "importe": importe,
        "cuenta_pgp": ""
    })
}

/// Wire-shape task message for queue ingestion tests.
///
/// `items` are (economica, importe) pairs; `declared` fills
/// `liquido_operaciones` when present.
pub fn raw_task(task_id: &str, items: &[(&str, &str)], declared: Option<&str>) -> Value {
    let aplicaciones: Vec<Value> = items
        .iter()
        .map(|(eco, imp)| raw_line_item(eco, imp))
        .collect();

    let detail = json!({
        "fecha": "15032024",
        "caja": "201",
        "expediente": "",
        "tercero": "P1234567H",
        "texto_sical": [{"tcargo": "Arqueo diario"}],
        "naturaleza": "5",
        "aplicaciones": aplicaciones,
        "descuentos": [],
        "aux_data": {},
        "metadata": {"generation_datetime": "2024-03-15T08:30:00Z"}
    });

    let mut task = json!({ "task_id": task_id, "detail": detail });
    if let Some(total) = declared {
        // The upstream generator carries the declared total next to the task
        // id, not inside the detail block.
        task["liquido_operaciones"] = json!(total);
    }
    task
}

/// Already-normalized single-item request for orchestrator-level tests.
pub fn request(task_id: &str, amounts_cents: &[i64], declared: Option<i64>) -> OperationRequest {
    let line_items = amounts_cents
        .iter()
        .enumerate()
        .map(|(i, &cents)| LineItem {
            year: "2024".to_string(),
            budget_code: format!("1{i:02}"),
            project_code: None,
            committed: Committed::default(),
            taxable_base: Cents(0),
            rate: Cents(0),
            amount: Cents(cents),
            pgp_account: None,
            account: "000".to_string(),
        })
        .collect();

    OperationRequest {
        task_id: task_id.to_string(),
        detail: OperationDetail {
            fecha: "15032024".to_string(),
            caja: "201".to_string(),
            expediente: "rbt-apunte-arqueo".to_string(),
            tercero: "P1234567H".to_string(),
            naturaleza: Naturaleza::Income,
            description: "Arqueo diario".to_string(),
            line_items,
            discounts: Vec::new(),
            aux_data: Default::default(),
            generated_at: None,
        },
        declared_total: declared.map(Cents),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_ledger_happy_path_assigns_numbers() {
        let mut ledger = ScriptedLedger::default();
        ledger.open().await.unwrap();
        assert!(ledger.is_open());

        let req = request("t-1", &[100_00, 250_50], None);
        ledger.submit_header(&req.detail).await.unwrap();
        for item in &req.detail.line_items {
            ledger.submit_line_item(item).await.unwrap();
        }
        assert_eq!(ledger.items_submitted(), 2);

        let outcome = ledger.confirm().await.unwrap();
        assert_eq!(outcome.assigned_operation_number, "220000001");
        ledger.close().await.unwrap();
        assert!(!ledger.is_open());
    }

    #[tokio::test]
    async fn fail_at_item_stops_mid_submission() {
        let mut ledger = ScriptedLedger::new(LedgerScript::FailAtItem(1));
        ledger.open().await.unwrap();

        let req = request("t-1", &[100_00, 200_00, 300_00], None);
        ledger.submit_header(&req.detail).await.unwrap();
        ledger.submit_line_item(&req.detail.line_items[0]).await.unwrap();
        let err = ledger
            .submit_line_item(&req.detail.line_items[1])
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::StepFailed { step: "submit_line_item", .. }));
        assert_eq!(ledger.items_submitted(), 1);
    }

    #[test]
    fn raw_task_matches_wire_shape() {
        let raw = raw_task("t-1", &[("130", "5000.00")], Some("5000.00"));
        assert_eq!(raw["task_id"], "t-1");
        assert_eq!(raw["detail"]["naturaleza"], "5");
        assert_eq!(raw["detail"]["aplicaciones"][0]["importe"], "5000.00");
        assert_eq!(raw["liquido_operaciones"], "5000.00");
    }
}
