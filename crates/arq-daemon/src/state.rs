//! Shared runtime state for arq-daemon.
//!
//! Everything is `Clone`-able via `Arc`; handlers receive
//! `State<Arc<AppState>>` from Axum. This module owns nothing async itself.

use arq_audit::AuditStore;
use arq_status::StatusBroadcaster;
use serde::Serialize;

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    /// Live status register and SSE bus, shared with the broker worker.
    pub status: StatusBroadcaster,
    /// Read side of the append-only task history.
    pub audit: AuditStore,
}

impl AppState {
    pub fn new(status: StatusBroadcaster, audit: AuditStore) -> Self {
        Self {
            build: BuildInfo {
                service: "arq-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            status,
            audit,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
