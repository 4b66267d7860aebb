//! Capability interface to the external ledger application (SICAL).
//!
//! The orchestration core drives the ledger exclusively through
//! [`LedgerDriver`]; it never manipulates windows or controls itself. The
//! concrete UI-automation adapter lives outside this workspace's core and is
//! injected at startup. Tests use the scripted double in `arq-testkit`.
//!
//! Every call is wrapped in a caller-level timeout by [`TimedLedger`] — the
//! external system is a single stateful session that can hang, and a hung
//! call must surface as an [`AutomationError`], not stall the consumer loop.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use arq_schemas::{Cents, LineItem, OperationDetail};

pub mod sim;

pub use sim::SimulatedLedger;

// ---------------------------------------------------------------------------
// AutomationError
// ---------------------------------------------------------------------------

/// Failures of the external ledger interaction.
///
/// `Unavailable` means the session could never be opened (task → FAILED, no
/// partial state). `StepFailed` / `Timeout` during item submission leave a
/// partial, not-rollbackable operation in the ledger (task → INCOMPLETED).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationError {
    /// The ledger session could not be opened or was lost.
    Unavailable(String),
    /// A concrete automation step failed.
    StepFailed { step: &'static str, reason: String },
    /// A caller-level timeout expired while waiting on the ledger.
    Timeout { step: &'static str, secs: u64 },
}

impl fmt::Display for AutomationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationError::Unavailable(reason) => {
                write!(f, "ledger session unavailable: {reason}")
            }
            AutomationError::StepFailed { step, reason } => {
                write!(f, "ledger step '{step}' failed: {reason}")
            }
            AutomationError::Timeout { step, secs } => {
                write!(f, "ledger step '{step}' timed out after {secs}s")
            }
        }
    }
}

impl std::error::Error for AutomationError {}

// ---------------------------------------------------------------------------
// Confirmation types
// ---------------------------------------------------------------------------

/// Acknowledgement returned by the ledger for one submitted line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemConfirmation {
    /// Running operation total as displayed by the ledger form, when the
    /// adapter can read it back.
    pub ledger_total: Option<Cents>,
}

/// Result of confirming (validating) the whole operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmOutcome {
    /// Operation number assigned by the ledger.
    pub assigned_operation_number: String,
}

// ---------------------------------------------------------------------------
// LedgerDriver
// ---------------------------------------------------------------------------

/// Abstract driver for one exclusive ledger session.
///
/// # Contract
/// - The session is a single, non-concurrent stateful resource; the
///   orchestrator serializes all calls on one worker.
/// - `open` must be called (and succeed) before any other method.
/// - `submit_line_item` calls happen in input order; once one has succeeded
///   there is no rollback through this interface.
/// - `confirm` validates the operation and yields the assigned operation
///   number; `close` releases the session and must be safe to call in any
///   state.
///
/// Futures are `Send` so the worker loop can live inside a spawned task.
pub trait LedgerDriver: Send {
    /// Open the ledger session (navigate to the arqueo form).
    fn open(&mut self) -> impl Future<Output = Result<(), AutomationError>> + Send;

    /// Whether an open session is currently held.
    fn is_open(&self) -> bool;

    /// Key the operation header (date, till, expediente, third party,
    /// nature, description) into the form.
    fn submit_header(
        &mut self,
        detail: &OperationDetail,
    ) -> impl Future<Output = Result<(), AutomationError>> + Send;

    /// Key one budget line into the form.
    fn submit_line_item(
        &mut self,
        item: &LineItem,
    ) -> impl Future<Output = Result<ItemConfirmation, AutomationError>> + Send;

    /// Validate the operation, capturing the assigned operation number.
    fn confirm(&mut self) -> impl Future<Output = Result<ConfirmOutcome, AutomationError>> + Send;

    /// Release the session. Best effort; must not fail on a closed session.
    fn close(&mut self) -> impl Future<Output = Result<(), AutomationError>> + Send;
}

// ---------------------------------------------------------------------------
// TimedLedger
// ---------------------------------------------------------------------------

/// Decorator imposing a per-call timeout on every driver method.
///
/// An exceeded timeout is an automation failure for that step — the task is
/// classified FAILED or INCOMPLETED by the orchestrator depending on where
/// it happened, and the consumer loop keeps running.
pub struct TimedLedger<L> {
    inner: L,
    timeout: Duration,
}

impl<L: LedgerDriver> TimedLedger<L> {
    pub fn new(inner: L, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(
        timeout: Duration,
        step: &'static str,
        fut: impl Future<Output = Result<T, AutomationError>> + Send,
    ) -> Result<T, AutomationError> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(AutomationError::Timeout {
                step,
                secs: timeout.as_secs(),
            }),
        }
    }
}

impl<L: LedgerDriver> LedgerDriver for TimedLedger<L> {
    async fn open(&mut self) -> Result<(), AutomationError> {
        Self::timed(self.timeout, "open", self.inner.open()).await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn submit_header(&mut self, detail: &OperationDetail) -> Result<(), AutomationError> {
        Self::timed(self.timeout, "submit_header", self.inner.submit_header(detail)).await
    }

    async fn submit_line_item(
        &mut self,
        item: &LineItem,
    ) -> Result<ItemConfirmation, AutomationError> {
        Self::timed(
            self.timeout,
            "submit_line_item",
            self.inner.submit_line_item(item),
        )
        .await
    }

    async fn confirm(&mut self) -> Result<ConfirmOutcome, AutomationError> {
        Self::timed(self.timeout, "confirm", self.inner.confirm()).await
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        Self::timed(self.timeout, "close", self.inner.close()).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Driver whose `open` never completes; everything else succeeds.
    struct HangingOpen {
        open: bool,
    }

    impl LedgerDriver for HangingOpen {
        async fn open(&mut self) -> Result<(), AutomationError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn is_open(&self) -> bool {
            self.open
        }

        async fn submit_header(&mut self, _d: &OperationDetail) -> Result<(), AutomationError> {
            Ok(())
        }

        async fn submit_line_item(
            &mut self,
            _i: &LineItem,
        ) -> Result<ItemConfirmation, AutomationError> {
            Ok(ItemConfirmation { ledger_total: None })
        }

        async fn confirm(&mut self) -> Result<ConfirmOutcome, AutomationError> {
            Ok(ConfirmOutcome {
                assigned_operation_number: "1".to_string(),
            })
        }

        async fn close(&mut self) -> Result<(), AutomationError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_open_times_out_as_automation_error() {
        let mut led = TimedLedger::new(HangingOpen { open: false }, Duration::from_secs(5));
        let err = led.open().await.unwrap_err();
        assert_eq!(err, AutomationError::Timeout { step: "open", secs: 5 });
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let mut led = TimedLedger::new(HangingOpen { open: true }, Duration::from_secs(5));
        assert!(led.is_open());
        let c = led.confirm().await.unwrap();
        assert_eq!(c.assigned_operation_number, "1");
    }

    #[test]
    fn automation_error_display() {
        let e = AutomationError::Unavailable("session unreachable".to_string());
        assert_eq!(e.to_string(), "ledger session unavailable: session unreachable");
        let e = AutomationError::Timeout { step: "confirm", secs: 30 };
        assert!(e.to_string().contains("timed out after 30s"));
    }
}
