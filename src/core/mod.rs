//! Core Module - Componenti infrastrutturali dell'applicazione
//!
//! Questo modulo contiene tutti i componenti "core" dell'applicazione:
//! - Autenticazione JWT e middleware di partecipazione
//! - Configurazione
//! - Gestione errori
//! - Stato applicazione

pub mod auth;
pub mod config;
pub mod error;
pub mod state;

// Re-exports per facilitare l'import
pub use auth::{
    Claims, Principal, authentication_middleware, conversation_membership_middleware, decode_jwt,
    encode_jwt,
};
pub use config::Config;
pub use error::{AppError, SyncError};
pub use state::AppState;
