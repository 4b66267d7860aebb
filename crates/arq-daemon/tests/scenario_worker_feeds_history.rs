//! Scenario: tasks processed by the orchestrator become visible through the
//! daemon's status and history endpoints.
//!
//! The orchestrator shares the status register and audit store with the HTTP
//! state, exactly as `main.rs` wires them. The ledger is the scripted test
//! double; no broker or network involved.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use arq_audit::AuditStore;
use arq_daemon::{routes, state::AppState};
use arq_normalize::AccountMap;
use arq_orchestrator::TaskOrchestrator;
use arq_status::StatusBroadcaster;
use arq_testkit::{raw_task, LedgerScript, ScriptedLedger};

async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = routes::build_router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn processed_tasks_show_up_in_history_and_counters() {
    let pool = arq_audit::connect_in_memory().await.unwrap();
    arq_audit::init_schema(&pool).await.unwrap();
    let audit = AuditStore::new(pool);
    let status = StatusBroadcaster::new();

    let mut orch = TaskOrchestrator::new(
        ScriptedLedger::new(LedgerScript::Succeed),
        AccountMap::default(),
        audit.clone(),
        status.clone(),
    );

    // One clean task, one with a declared-total mismatch.
    orch.handle_raw(&raw_task("t-ok", &[("130", "100.00")], Some("100.00")).to_string())
        .await
        .unwrap();
    orch.handle_raw(&raw_task("t-off", &[("130", "700.00")], Some("1500.00")).to_string())
        .await
        .unwrap();

    let st = Arc::new(AppState::new(status, audit));

    let (code, stats) = get_json(Arc::clone(&st), "/v1/history/stats").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["incompleted"], 1);

    let (code, history) = get_json(Arc::clone(&st), "/v1/history?q=t-off").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["status"], "INCOMPLETED");
    assert!(history[0]["error"]
        .as_str()
        .unwrap()
        .contains("reconciliation mismatch"));

    let (code, live) = get_json(st, "/v1/status").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(live["counters"]["completed"], 1);
    assert_eq!(live["counters"]["incompleted"], 1);
    assert!(live["current_task"].is_null());
}
