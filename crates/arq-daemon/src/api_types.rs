//! Response bodies for the daemon's JSON API.

use arq_status::StatusSnapshot;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
