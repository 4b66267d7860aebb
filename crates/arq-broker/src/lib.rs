//! AMQP ingestion and result publication.
//!
//! One durable input queue feeds the single worker; results go to one fixed
//! durable output queue tagged with `correlation_id = task_id` so any number
//! of independent consumers can filter without parsing bodies.
//!
//! Acknowledgement protocol (at-least-once):
//! - a delivery is acked only after the task reached a terminal state, the
//!   audit row exists, and the result was published;
//! - an unusable body (no `task_id`) is rejected without requeue;
//! - any infrastructure failure (audit write, publish) leaves the delivery
//!   unacked for redelivery — the audit row makes the replay idempotent.
//!
//! Connectivity loss never stops the worker: [`BrokerWorker::run`] supervises
//! its own connection and reconnects with bounded backoff whenever the
//! delivery stream breaks or ends. Unacked deliveries come back on the fresh
//! channel and replay through the audit store.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use tracing::{error, info, warn};

use arq_ledger::LedgerDriver;
use arq_orchestrator::{TaskOrchestrator, TaskOutcome, UnusableMessage};
use arq_schemas::ResultEnvelope;
use arq_status::StatusBroadcaster;

/// Durable queue the upstream generator publishes tasks to.
pub const TASK_QUEUE: &str = "sical_queue.arqueo";
/// Fixed durable queue every result is published to.
pub const RESULTS_QUEUE: &str = "sical_results";

const CONSUMER_TAG: &str = "arqueo-engine";
const CONNECT_ATTEMPTS: u32 = 8;
const CONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Ack policy
// ---------------------------------------------------------------------------

/// What to do with a delivery after the orchestrator has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Terminal state reached and audited: consume the message.
    Ack,
    /// The body can never be processed (no correlation key): dead-letter it.
    RejectNoRequeue,
    /// Infrastructure failure: leave it for redelivery.
    Requeue,
}

/// Pure mapping from orchestration outcome to acknowledgement.
pub fn ack_decision(handled: &Result<TaskOutcome>) -> AckDecision {
    match handled {
        Ok(_) => AckDecision::Ack,
        Err(err) if err.downcast_ref::<UnusableMessage>().is_some() => AckDecision::RejectNoRequeue,
        Err(_) => AckDecision::Requeue,
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Connect with bounded exponential backoff.
pub async fn connect_with_retry(url: &str, status: &StatusBroadcaster) -> Result<Connection> {
    let mut delay = CONNECT_BACKOFF_START;
    let mut last_err = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(conn) => {
                info!(attempt, "connected to broker");
                status.broker_connected();
                return Ok(conn);
            }
            Err(err) => {
                warn!(attempt, error = %err, "broker connection failed");
                status.broker_disconnected(err.to_string());
                last_err = Some(err);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
            }
        }
    }

    Err(last_err.map(anyhow::Error::new).unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
        .with_context(|| format!("broker unreachable after {CONNECT_ATTEMPTS} attempts"))
}

/// Declare both durable queues on a fresh channel with prefetch 1.
pub async fn open_channel(conn: &Connection) -> Result<Channel> {
    let channel = conn.create_channel().await.context("create channel")?;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .context("set prefetch")?;

    let durable = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };
    channel
        .queue_declare(TASK_QUEUE, durable, FieldTable::default())
        .await
        .with_context(|| format!("declare queue {TASK_QUEUE}"))?;
    channel
        .queue_declare(RESULTS_QUEUE, durable, FieldTable::default())
        .await
        .with_context(|| format!("declare queue {RESULTS_QUEUE}"))?;

    Ok(channel)
}

// ---------------------------------------------------------------------------
// ResultPublisher
// ---------------------------------------------------------------------------

/// Publishes result envelopes to the fixed results queue.
#[derive(Clone)]
pub struct ResultPublisher {
    channel: Channel,
}

impl ResultPublisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Publish one envelope, persistent, correlation-tagged with the task id.
    pub async fn publish(&self, envelope: &ResultEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope).context("serialize result envelope")?;
        let properties = BasicProperties::default()
            .with_correlation_id(envelope.operation_id.as_str().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        self.channel
            .basic_publish(
                "",
                RESULTS_QUEUE,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .context("publish result")?
            .await
            .context("result publish confirmation")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// The single consumer: dequeues one task at a time, drives it through the
/// orchestrator, publishes the result, then acknowledges.
///
/// Owns its connection lifecycle: `run` reconnects whenever the consume
/// cycle breaks, so a broker restart mid-run costs redeliveries, not the
/// process.
pub struct BrokerWorker<L: LedgerDriver> {
    broker_url: String,
    orchestrator: TaskOrchestrator<L>,
    status: StatusBroadcaster,
}

impl<L: LedgerDriver> BrokerWorker<L> {
    pub fn new(
        broker_url: impl Into<String>,
        orchestrator: TaskOrchestrator<L>,
        status: StatusBroadcaster,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            orchestrator,
            status,
        }
    }

    /// Supervision loop: connect, consume until the connection dies, repeat.
    ///
    /// Never returns on connectivity loss. A failed connect round backs off
    /// and starts over; a broken or ended delivery stream is surfaced as a
    /// broker-disconnected event and followed by a reconnect.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let connection = match connect_with_retry(&self.broker_url, &self.status).await {
                Ok(conn) => conn,
                Err(err) => {
                    error!(error = %err, "broker unreachable; starting next connect round");
                    tokio::time::sleep(CONNECT_BACKOFF_CAP).await;
                    continue;
                }
            };
            let channel = match open_channel(&connection).await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(error = %err, "channel setup failed; reconnecting");
                    self.status.broker_disconnected(err.to_string());
                    tokio::time::sleep(CONNECT_BACKOFF_START).await;
                    continue;
                }
            };

            match self.consume(channel).await {
                Ok(()) => {
                    warn!("delivery stream ended; reconnecting");
                    self.status.broker_disconnected("delivery stream ended");
                }
                Err(err) => {
                    warn!(error = %err, "consumer failed; reconnecting");
                    self.status.broker_disconnected(err.to_string());
                }
            }
            tokio::time::sleep(CONNECT_BACKOFF_START).await;
        }
    }

    /// Consume on one channel until it breaks. Processing is strictly
    /// sequential: prefetch 1 plus a single consumer means at most one task
    /// is in flight. Any ack/reject failure means the channel is gone; the
    /// error bubbles to `run`, which reconnects, and the unacked delivery
    /// comes back.
    async fn consume(&mut self, channel: Channel) -> Result<()> {
        let publisher = ResultPublisher::new(channel.clone());
        let mut consumer = channel
            .basic_consume(
                TASK_QUEUE,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("consume from {TASK_QUEUE}"))?;

        info!(queue = TASK_QUEUE, "worker consuming");

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.context("broken delivery stream")?;
            let raw = String::from_utf8_lossy(&delivery.data).into_owned();

            let handled = self.handle(&publisher, &raw).await;
            match ack_decision(&handled) {
                AckDecision::Ack => {
                    delivery
                        .ack(BasicAckOptions::default())
                        .await
                        .context("ack delivery")?;
                }
                AckDecision::RejectNoRequeue => {
                    if let Err(err) = &handled {
                        error!(error = %err, "dropping unprocessable message");
                        self.status
                            .log("ERROR", format!("dropping unprocessable message: {err}"));
                    }
                    delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                        .context("reject delivery")?;
                }
                AckDecision::Requeue => {
                    if let Err(err) = &handled {
                        error!(error = %err, "task left unacked for redelivery");
                    }
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                        .context("nack delivery")?;
                }
            }
        }

        Ok(())
    }

    /// Orchestrate, then publish. Publish failure propagates so the delivery
    /// stays unacked; the audit row turns the redelivery into a replay.
    async fn handle(&mut self, publisher: &ResultPublisher, raw: &str) -> Result<TaskOutcome> {
        let outcome = self.orchestrator.handle_raw(raw).await?;
        publisher
            .publish(outcome.envelope())
            .await
            .context("publish result envelope")?;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use arq_schemas::{OperationResult, OperationStatus};
    use chrono::Utc;

    fn dummy_outcome() -> TaskOutcome {
        let mut result = OperationResult::started_at(Utc::now());
        result.status = OperationStatus::Completed;
        TaskOutcome::Processed(ResultEnvelope::new("t-1", result))
    }

    #[test]
    fn terminal_outcome_is_acked() {
        assert_eq!(ack_decision(&Ok(dummy_outcome())), AckDecision::Ack);
    }

    #[test]
    fn unusable_message_is_rejected_without_requeue() {
        let err: Result<TaskOutcome> =
            Err(UnusableMessage("missing task_id".to_string()).into());
        assert_eq!(ack_decision(&err), AckDecision::RejectNoRequeue);
    }

    #[test]
    fn infrastructure_failure_is_requeued() {
        let err: Result<TaskOutcome> = Err(anyhow::anyhow!("audit write failed"));
        assert_eq!(ack_decision(&err), AckDecision::Requeue);

        let wrapped: Result<TaskOutcome> =
            Err(anyhow::anyhow!("publish failed").context("publish result envelope"));
        assert_eq!(ack_decision(&wrapped), AckDecision::Requeue);
    }

    #[test]
    fn wrapped_unusable_message_is_still_rejected() {
        let err: Result<TaskOutcome> = Err(anyhow::Error::new(UnusableMessage(
            "body is not JSON".to_string(),
        ))
        .context("handling delivery"));
        assert_eq!(ack_decision(&err), AckDecision::RejectNoRequeue);
    }

    #[test]
    fn queue_names_are_fixed() {
        assert_eq!(TASK_QUEUE, "sical_queue.arqueo");
        assert_eq!(RESULTS_QUEUE, "sical_results");
    }

    // Nothing listens on port 1, so every connect attempt is refused
    // immediately; paused time fast-forwards through the backoff sleeps.
    // The clock is paused only after pool setup: sqlx's acquire timeout
    // misfires under an already-paused clock.
    #[tokio::test]
    async fn worker_keeps_retrying_an_unreachable_broker() {
        let pool = arq_audit::connect_in_memory().await.unwrap();
        arq_audit::init_schema(&pool).await.unwrap();
        tokio::time::pause();
        let status = StatusBroadcaster::new();
        let orchestrator = TaskOrchestrator::new(
            arq_testkit::ScriptedLedger::default(),
            arq_normalize::AccountMap::default(),
            arq_audit::AuditStore::new(pool),
            status.clone(),
        );

        let worker = BrokerWorker::new("amqp://127.0.0.1:1/%2f", orchestrator, status.clone());
        let handle = tokio::spawn(worker.run());

        // Several full connect rounds of virtual time pass; the worker must
        // still be supervising, not returned.
        let waited = tokio::time::timeout(Duration::from_secs(600), handle).await;
        assert!(waited.is_err(), "worker must keep reconnecting, not exit");
        assert!(!status.snapshot().broker_connected);
    }
}
