//! Deterministic simulated ledger driver.
//!
//! Stands in for the site-specific UI-automation adapter: every operation is
//! accepted and numbered sequentially. No randomness, no I/O. The daemon
//! runs on this driver until a real adapter is wired in at deployment.

use crate::{AutomationError, ConfirmOutcome, ItemConfirmation, LedgerDriver};
use arq_schemas::{Cents, LineItem, OperationDetail};

/// Accepts every operation and assigns deterministic operation numbers
/// (`SIM-000001`, `SIM-000002`, ...). Maintains the running total of the
/// open operation so confirmations mirror a real form readback.
pub struct SimulatedLedger {
    open: bool,
    next_operation: u64,
    running_total: Cents,
    operations_confirmed: u64,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self {
            open: false,
            next_operation: 1,
            running_total: Cents::ZERO,
            operations_confirmed: 0,
        }
    }

    pub fn operations_confirmed(&self) -> u64 {
        self.operations_confirmed
    }
}

impl LedgerDriver for SimulatedLedger {
    async fn open(&mut self) -> Result<(), AutomationError> {
        self.open = true;
        self.running_total = Cents::ZERO;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn submit_header(&mut self, _detail: &OperationDetail) -> Result<(), AutomationError> {
        if !self.open {
            return Err(AutomationError::Unavailable("session not open".to_string()));
        }
        Ok(())
    }

    async fn submit_line_item(
        &mut self,
        item: &LineItem,
    ) -> Result<ItemConfirmation, AutomationError> {
        if !self.open {
            return Err(AutomationError::Unavailable("session not open".to_string()));
        }
        self.running_total = self.running_total + item.amount;
        Ok(ItemConfirmation {
            ledger_total: Some(self.running_total),
        })
    }

    async fn confirm(&mut self) -> Result<ConfirmOutcome, AutomationError> {
        if !self.open {
            return Err(AutomationError::Unavailable("session not open".to_string()));
        }
        let n = self.next_operation;
        self.next_operation += 1;
        self.operations_confirmed += 1;
        Ok(ConfirmOutcome {
            assigned_operation_number: format!("SIM-{n:06}"),
        })
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        self.open = false;
        Ok(())
    }
}
