//! Health and history HTTP handlers

use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::{Value, json};
use tracing::debug;

use crate::logger::ChatMessage;
use crate::state::AppState;

/// Health check endpoint, also served at the root path.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Chat history of the most recent logged session, oldest first.
pub async fn last_session_history(State(state): State<Arc<AppState>>) -> Json<Vec<ChatMessage>> {
    let history = state.log_sink.reconstruct_last_session_history();
    debug!("Reconstructed {} history messages", history.len());
    Json(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_shape() {
        let Json(body) = health_check().await;
        assert_eq!(body["status"], "healthy");
    }
}
