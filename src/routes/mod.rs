//! Router assembly
//!
//! - `GET /` and `GET /health` - health checks
//! - `GET /history` - reconstructed chat history of the last session
//! - `GET /ws` - relay WebSocket upgrade

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::session::relay_handler;
use crate::state::AppState;

/// Create the application router.
pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/health", get(api::health_check))
        .route("/history", get(api::last_session_history))
        .route("/ws", get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
