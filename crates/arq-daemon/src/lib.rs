//! HTTP status daemon for the arqueo engine.
//!
//! Serves health, live status, an SSE event stream, and the audit history
//! (with exports) next to the broker worker. `main.rs` wires everything;
//! handlers live in `routes.rs`, shared state in `state.rs`.

pub mod api_types;
pub mod routes;
pub mod state;
