//! Live status publication for the arqueo engine.
//!
//! [`StatusBroadcaster`] is the single place the worker reports progress to.
//! It fans each [`StatusEvent`] out to registered in-process listeners and to
//! a `tokio::sync::broadcast` bus (consumed by the daemon's SSE endpoint),
//! and folds events into a queryable [`StatusSnapshot`].
//!
//! Publication must never break the pipeline: a panicking listener is caught
//! and dropped from that dispatch, a lagging bus subscriber just loses
//! events. All mutation happens under one `std::sync::Mutex`, so snapshots
//! are consistent and safe from any thread.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use arq_schemas::OperationStatus;

/// Log lines retained in the snapshot ring buffer.
const LOG_RING_CAPACITY: usize = 200;

/// Broadcast bus depth before slow subscribers start lagging.
const BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// StatusEvent
// ---------------------------------------------------------------------------

/// One observable state change, broadcast over the bus and to listeners.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    BrokerConnected,
    BrokerDisconnected { reason: String },
    TaskReceived { task_id: String },
    TaskStarted { task_id: String },
    ItemSubmitted { task_id: String, index: usize, total: usize },
    TaskFinished { task_id: String, status: OperationStatus },
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Progress of the task currently on the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    /// Items already keyed into the ledger.
    pub items_done: usize,
    pub items_total: usize,
}

/// Terminal-status counters since process start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub completed: u64,
    pub incompleted: u64,
    pub failed: u64,
}

impl TaskCounters {
    pub fn total(&self) -> u64 {
        self.completed + self.incompleted + self.failed
    }

    fn bump(&mut self, status: OperationStatus) {
        match status {
            OperationStatus::Completed => self.completed += 1,
            OperationStatus::Incompleted => self.incompleted += 1,
            OperationStatus::Failed => self.failed += 1,
            // Non-terminal statuses never reach TaskFinished.
            OperationStatus::Pending | OperationStatus::InProgress => {}
        }
    }
}

/// Point-in-time view of the engine, returned by GET /v1/status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub broker_connected: bool,
    /// Task currently in progress, if any.
    pub current_task: Option<TaskProgress>,
    pub counters: TaskCounters,
    /// Most recent log lines, oldest first.
    pub recent_log: Vec<String>,
}

// ---------------------------------------------------------------------------
// StatusBroadcaster
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

struct Inner {
    broker_connected: bool,
    current_task: Option<TaskProgress>,
    counters: TaskCounters,
    recent_log: VecDeque<String>,
    listeners: Vec<Listener>,
}

/// Cloneable handle; all clones share the same state and bus.
#[derive(Clone)]
pub struct StatusBroadcaster {
    inner: Arc<Mutex<Inner>>,
    bus: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (bus, _rx) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                broker_connected: false,
                current_task: None,
                counters: TaskCounters::default(),
                recent_log: VecDeque::with_capacity(LOG_RING_CAPACITY),
                listeners: Vec::new(),
            })),
            bus,
        }
    }

    /// Register a callback invoked on every published event.
    ///
    /// Callbacks run on the publishing thread, outside the state lock. A
    /// panicking callback is caught; it does not disturb other listeners or
    /// the publisher.
    pub fn register(&self, listener: impl Fn(&StatusEvent) + Send + Sync + 'static) {
        self.lock().listeners.push(Arc::new(listener));
    }

    /// Subscribe to the live event bus (SSE fan-out).
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.bus.subscribe()
    }

    /// Publish one event: fold into the snapshot, notify listeners, send on
    /// the bus.
    pub fn publish(&self, event: StatusEvent) {
        let listeners: Vec<Listener> = {
            let mut inner = self.lock();
            inner.apply(&event);
            inner.listeners.clone()
        };

        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(&event)));
        }

        // No subscribers is normal at boot.
        let _ = self.bus.send(event);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            broker_connected: inner.broker_connected,
            current_task: inner.current_task.clone(),
            counters: inner.counters,
            recent_log: inner.recent_log.iter().cloned().collect(),
        }
    }

    // Convenience publishers used by the worker and broker loops.

    pub fn broker_connected(&self) {
        self.publish(StatusEvent::BrokerConnected);
    }

    pub fn broker_disconnected(&self, reason: impl Into<String>) {
        self.publish(StatusEvent::BrokerDisconnected { reason: reason.into() });
    }

    pub fn task_received(&self, task_id: &str) {
        self.publish(StatusEvent::TaskReceived { task_id: task_id.to_string() });
    }

    pub fn task_started(&self, task_id: &str) {
        self.publish(StatusEvent::TaskStarted { task_id: task_id.to_string() });
    }

    pub fn item_submitted(&self, task_id: &str, index: usize, total: usize) {
        self.publish(StatusEvent::ItemSubmitted {
            task_id: task_id.to_string(),
            index,
            total,
        });
    }

    pub fn task_finished(&self, task_id: &str, status: OperationStatus) {
        self.publish(StatusEvent::TaskFinished {
            task_id: task_id.to_string(),
            status,
        });
    }

    pub fn log(&self, level: &str, msg: impl Into<String>) {
        self.publish(StatusEvent::LogLine {
            level: level.to_string(),
            msg: msg.into(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a listener-free section panicked while
        // holding it; the snapshot data is still usable.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn apply(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::BrokerConnected => self.broker_connected = true,
            StatusEvent::BrokerDisconnected { .. } => self.broker_connected = false,
            StatusEvent::TaskReceived { .. } => {}
            StatusEvent::TaskStarted { task_id } => {
                self.current_task = Some(TaskProgress {
                    task_id: task_id.clone(),
                    started_at: Utc::now(),
                    items_done: 0,
                    items_total: 0,
                });
            }
            StatusEvent::ItemSubmitted { task_id, index, total } => {
                if let Some(progress) = self.current_task.as_mut() {
                    if progress.task_id == *task_id {
                        progress.items_done = index + 1;
                        progress.items_total = *total;
                    }
                }
            }
            StatusEvent::TaskFinished { task_id, status } => {
                self.counters.bump(*status);
                if self
                    .current_task
                    .as_ref()
                    .is_some_and(|p| p.task_id == *task_id)
                {
                    self.current_task = None;
                }
                self.push_log(format!("task {task_id} finished: {status}"));
            }
            StatusEvent::LogLine { level, msg } => {
                self.push_log(format!("[{level}] {msg}"));
            }
        }
    }

    fn push_log(&mut self, line: String) {
        if self.recent_log.len() == LOG_RING_CAPACITY {
            self.recent_log.pop_front();
        }
        self.recent_log.push_back(line);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
