//! Scenario: daemon surfaces live status and audit history over HTTP.
//!
//! All tests are pure in-process; the audit store is an in-memory SQLite
//! database and the status register is seeded directly. No broker required.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot

use arq_audit::{payload_hash, AuditStore, TaskRecord};
use arq_daemon::{routes, state::AppState};
use arq_schemas::{Cents, OperationStatus};
use arq_status::StatusBroadcaster;
use chrono::Utc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn app_state() -> Arc<AppState> {
    let pool = arq_audit::connect_in_memory().await.unwrap();
    arq_audit::init_schema(&pool).await.unwrap();
    Arc::new(AppState::new(StatusBroadcaster::new(), AuditStore::new(pool)))
}

fn record(task_id: &str, status: OperationStatus) -> TaskRecord {
    let now = Utc::now();
    let raw = serde_json::json!({"task_id": task_id});
    TaskRecord {
        task_id: task_id.to_string(),
        status,
        init_time: now,
        end_time: now,
        duration_secs: 1.0,
        assigned_operation_number: None,
        declared_total: None,
        computed_sum: Cents(10_000),
        error: None,
        payload_sha256: payload_hash(&raw.to_string()),
        raw_payload: raw,
        recorded_at: now,
    }
}

async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, bytes::Bytes) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = routes::build_router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_service_and_version() {
    let st = app_state().await;
    let (status, body) = get(st, "/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "arq-daemon");
}

#[tokio::test]
async fn status_reflects_the_live_register() {
    let st = app_state().await;
    st.status.broker_connected();
    st.status.task_started("t-1");
    st.status.item_submitted("t-1", 0, 2);

    let (status, body) = get(st, "/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["broker_connected"], true);
    assert_eq!(json["current_task"]["task_id"], "t-1");
    assert_eq!(json["current_task"]["items_done"], 1);
    assert!(json["daemon_uptime_secs"].is_u64());
}

#[tokio::test]
async fn history_filters_by_status() {
    let st = app_state().await;
    st.audit
        .insert_once(&record("t-ok", OperationStatus::Completed))
        .await
        .unwrap();
    st.audit
        .insert_once(&record("t-bad", OperationStatus::Failed))
        .await
        .unwrap();

    let (status, body) = get(Arc::clone(&st), "/v1/history?status=FAILED").await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["task_id"], "t-bad");

    let (status, _body) = get(st, "/v1/history?status=BOGUS").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn history_stats_count_outcomes() {
    let st = app_state().await;
    st.audit
        .insert_once(&record("t-1", OperationStatus::Completed))
        .await
        .unwrap();
    st.audit
        .insert_once(&record("t-2", OperationStatus::Incompleted))
        .await
        .unwrap();

    let (status, body) = get(st, "/v1/history/stats").await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["completed"], 1);
    assert_eq!(json["incompleted"], 1);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn export_serves_csv_and_rejects_unknown_format() {
    let st = app_state().await;
    st.audit
        .insert_once(&record("t-1", OperationStatus::Completed))
        .await
        .unwrap();

    let req = Request::builder()
        .method("GET")
        .uri("/v1/history/export?format=csv")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = routes::build_router(Arc::clone(&st)).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/csv"
    );
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("task_id,status"));
    assert!(text.contains("t-1"));

    let (status, _body) = get(st, "/v1/history/export?format=pdf").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
