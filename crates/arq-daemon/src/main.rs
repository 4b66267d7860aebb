//! arq-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, opens the audit
//! store, connects to the broker, spawns the single worker, and starts the
//! HTTP server. All route handlers live in `routes.rs`; shared state types
//! live in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use arq_audit::AuditStore;
use arq_broker::BrokerWorker;
use arq_config::Settings;
use arq_daemon::{routes, state::AppState};
use arq_ledger::{SimulatedLedger, TimedLedger};
use arq_orchestrator::TaskOrchestrator;
use arq_status::StatusBroadcaster;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::dotenv();

    init_tracing();

    let settings = Settings::from_env()?;
    let accounts = settings.load_account_map()?;
    info!(accounts = accounts.len(), "account map loaded");

    let pool = arq_audit::connect(&settings.audit_db_path).await?;
    arq_audit::init_schema(&pool).await?;
    let audit = AuditStore::new(pool);

    let status = StatusBroadcaster::new();

    // The simulated driver stands in until a site-specific automation
    // adapter is wired here. Every ledger call carries the configured
    // timeout so a hung session cannot stall the consumer loop.
    let ledger = TimedLedger::new(SimulatedLedger::new(), settings.ledger_timeout);
    let orchestrator = TaskOrchestrator::new(ledger, accounts, audit.clone(), status.clone());

    // The worker owns its broker connection and reconnects on loss; it only
    // ever leaves this spawn by panicking.
    let worker = BrokerWorker::new(settings.broker_url.clone(), orchestrator, status.clone());
    let worker_handle = tokio::spawn(worker.run());

    let shared = Arc::new(AppState::new(status, audit));
    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {:?}", settings.bind_addr))?;
    info!("arq-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::select! {
        res = axum::serve(listener, app) => {
            res.context("server crashed")?;
        }
        res = worker_handle => {
            res.context("worker panicked")?.context("worker stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
        .allow_headers(tower_http::cors::Any)
}
