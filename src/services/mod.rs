//! Services module - Coordinatore per tutti i service handler HTTP
//!
//! Gli endpoint HTTP coprono il lato durevole (store); il lato live passa dal websocket.

pub mod chat;

// Re-exports per facilitare l'import
pub use chat::{
    create_conversation, delete_conversation, get_conversation, get_messages, get_participants,
    get_typing, list_conversations, mark_read, rename_conversation, send_message,
};

use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

/// Root endpoint - health check
pub async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        format!(
            "Server is running! store: {}, connections: {}",
            state.store.backend(),
            state.sync.connection_count()
        ),
    )
}
