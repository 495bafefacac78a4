//! chatsync - sincronizzazione real-time di conversazioni
//!
//! Espone i moduli principali per il binario e per i test di integrazione.

pub mod core;
pub mod dtos;
pub mod entities;
pub mod repositories;
pub mod services;
pub mod sync;
pub mod ws;

// Re-export dei tipi principali per facilitare l'import
pub use crate::core::{AppError, AppState, SyncError, auth, config};
pub use services::root;

use axum::{
    Router, middleware,
    routing::{any, get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Crea il router principale dell'applicazione
pub fn create_router(state: Arc<AppState>) -> Router {
    use crate::core::authentication_middleware;
    use ws::ws_handler;

    Router::new()
        .route("/", get(root))
        .nest("/chats", configure_chat_routes(state.clone()))
        .route(
            "/ws",
            any(ws_handler).layer(middleware::from_fn_with_state(
                state.clone(),
                authentication_middleware,
            )),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Configura le routes per conversazioni e messaggi
fn configure_chat_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    use crate::core::{authentication_middleware, conversation_membership_middleware};
    use services::*;

    // Rotte che NON richiedono partecipazione (solo autenticazione)
    let public_routes = Router::new()
        .route("/", get(list_conversations).post(create_conversation))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            authentication_middleware,
        ));

    // Rotte che richiedono partecipazione (autenticazione + membership middleware)
    let member_routes = Router::new()
        .route(
            "/{conversation_id}",
            get(get_conversation)
                .patch(rename_conversation)
                .delete(delete_conversation),
        )
        .route("/{conversation_id}/participants", get(get_participants))
        .route("/{conversation_id}/typing", get(get_typing))
        .route("/{conversation_id}/messages", get(get_messages).post(send_message))
        .route("/{conversation_id}/read", post(mark_read))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            conversation_membership_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state,
            authentication_middleware,
        ));

    public_routes.merge(member_routes)
}
