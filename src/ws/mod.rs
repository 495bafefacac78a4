//! WebSocket Module - Gestione WebSocket per comunicazione real-time
//!
//! Questo modulo gestisce le connessioni WebSocket per la comunicazione in tempo reale
//! tra client e server. Include:
//! - Gestione upgrade HTTP -> WebSocket
//! - Gestione connessioni (split sender/receiver, un task per lato)
//! - Dispatch degli eventi del protocollo verso la façade di sincronizzazione

pub mod connection;
pub mod event_handlers;

// Re-exports pubblici
pub use connection::handle_socket;

use crate::AppState;
use crate::core::Principal;
use axum::{
    Extension,
    extract::{State, ws::WebSocketUpgrade},
    response::Response,
};
use std::sync::Arc;

/// Dopo questo tempo senza frame in ingresso la connessione viene chiusa
pub const TIMEOUT_DURATION_SECONDS: u64 = 300;

/// Intervallo minimo tra due frame processati della stessa connessione
pub const RATE_LIMITER_MILLIS: u64 = 10;

/// Entry point per gestire richieste di upgrade WebSocket
/// Operazioni:
/// 1. Estrarre l'identità dall'autenticazione JWT
/// 2. Eseguire upgrade HTTP -> WebSocket
/// 3. Passare la connessione ad handle_socket
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>, // ottenuto dall'autenticazione JWT
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}
