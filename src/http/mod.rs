//! The gateway's HTTP surface: route table, shared state, and the handlers
//! behind each route.

mod handlers;
mod state;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Assemble the full route table. Split out from `main` so integration
/// tests can build a router against a [`AppState`] wired with a fake PTY
/// spawner.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/terminal/create", post(handlers::create_terminal))
        .route("/terminal/input/{id}", post(handlers::input))
        .route("/terminal/resize/{id}", post(handlers::resize))
        .route("/terminal/output/{id}", get(handlers::output))
        .route("/terminal/status/{id}", get(handlers::status))
        .route("/terminal/heartbeat/{id}", post(handlers::heartbeat))
        .route("/terminal/ping/{id}", get(handlers::ping))
        .route("/terminal/close/{id}", post(handlers::close))
        .route("/terminal/report-rtt/{id}", post(handlers::report_rtt))
        .route("/terminal/network-status/{id}", get(handlers::network_status))
        .route("/terminal/reset-network/{id}", post(handlers::reset_network))
        .route("/terminal/performance", get(handlers::performance))
        .route("/env", get(handlers::env))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
