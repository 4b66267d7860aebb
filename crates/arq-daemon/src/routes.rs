//! Axum router and all HTTP handlers for arq-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)`-free so the scenario tests
//! in `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;

use arq_audit::TaskQuery;
use arq_schemas::OperationStatus;
use arq_status::StatusEvent;

use crate::{
    api_types::{ErrorResponse, HealthResponse, StatusResponse},
    state::{uptime_secs, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/history", get(history))
        .route("/v1/history/stats", get(history_stats))
        .route("/v1/history/export", get(history_export))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = st.status.snapshot();
    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: uptime_secs(),
            snapshot,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/history
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Terminal status filter, e.g. `COMPLETED`.
    pub status: Option<String>,
    /// RFC 3339 lower bound on recording time.
    pub from: Option<DateTime<Utc>>,
    /// RFC 3339 upper bound on recording time.
    pub to: Option<DateTime<Utc>>,
    /// Free-text match against task id, error, operation number.
    pub q: Option<String>,
    pub limit: Option<i64>,
}

impl HistoryParams {
    fn to_query(&self) -> Result<TaskQuery, Response> {
        let status = match &self.status {
            Some(raw) => Some(OperationStatus::parse(raw).ok_or_else(|| {
                bad_request(format!("unknown status {raw:?}"))
            })?),
            None => None,
        };
        Ok(TaskQuery {
            status,
            from: self.from,
            to: self.to,
            text: self.q.clone(),
            limit: self.limit,
        })
    }
}

async fn history(
    State(st): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let query = match params.to_query() {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    match st.audit.query(&query).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => internal_error("history query failed", err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/history/stats
// ---------------------------------------------------------------------------

async fn history_stats(State(st): State<Arc<AppState>>) -> Response {
    match st.audit.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => internal_error("stats query failed", err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/history/export
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    /// `csv` (default), `json`, or `xlsx`.
    pub format: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub q: Option<String>,
    pub limit: Option<i64>,
}

async fn history_export(
    State(st): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Response {
    let history = HistoryParams {
        status: params.status.clone(),
        from: params.from,
        to: params.to,
        q: params.q.clone(),
        limit: params.limit,
    };
    let query = match history.to_query() {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let records = match st.audit.query(&query).await {
        Ok(records) => records,
        Err(err) => return internal_error("history query failed", err),
    };

    let format = params.format.as_deref().unwrap_or("csv");
    let built = match format {
        "csv" => arq_audit::export::csv_bytes(&records).map(|b| (b, "text/csv", "history.csv")),
        "json" => arq_audit::export::json_bytes(&records)
            .map(|b| (b, "application/json", "history.json")),
        "xlsx" => arq_audit::export::xlsx_bytes(&records).map(|b| {
            (
                b,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                "history.xlsx",
            )
        }),
        other => return bad_request(format!("unknown export format {other:?}")),
    };

    match built {
        Ok((bytes, content_type, filename)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => internal_error("export failed", err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.status.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<StatusEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => {
                let event_name = match &event {
                    StatusEvent::BrokerConnected | StatusEvent::BrokerDisconnected { .. } => {
                        "broker"
                    }
                    StatusEvent::TaskReceived { .. }
                    | StatusEvent::TaskStarted { .. }
                    | StatusEvent::ItemSubmitted { .. }
                    | StatusEvent::TaskFinished { .. } => "task",
                    StatusEvent::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&event).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg })).into_response()
}

fn internal_error(what: &str, err: anyhow::Error) -> Response {
    error!(error = %err, "{what}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{what}: {err}"),
        }),
    )
        .into_response()
}
