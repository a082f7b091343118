//! HTTP surface: health probes and the WebSocket session endpoint.

mod health;
mod session;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(session::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
