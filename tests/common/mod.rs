#![allow(dead_code)]

use axum_test::TestServer;
use chatsync::core::{AppState, Config};
use chatsync::repositories::{MemoryStore, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub const JWT_SECRET: &str = "ilmiobellissimosegretochevaassolutamentecambiato";

/// Configurazione di test: store in memoria e secret noto
pub fn test_config() -> Config {
    Config {
        jwt_secret: JWT_SECRET.to_string(),
        ..Config::default()
    }
}

/// Crea un AppState per i test, sempre su MemoryStore
///
/// # Returns
/// Arc<AppState> configurato con il JWT secret di test
pub fn create_test_state() -> Arc<AppState> {
    Arc::new(AppState::new(Store::Memory(MemoryStore::new()), test_config()))
}

/// Crea un TestServer per i test
///
/// # Arguments
/// * `state` - AppState da utilizzare per il server
///
/// # Returns
/// TestServer configurato e pronto per eseguire richieste
pub fn create_test_server(state: Arc<AppState>) -> TestServer {
    let app = chatsync::create_router(state);
    TestServer::new(app).expect("Failed to create test server")
}

/// Avvia il router su una porta effimera, per i test con un vero client websocket
pub async fn spawn_test_app(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("listener has an address");
    let app = chatsync::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server crashed");
    });
    addr
}

/// Genera un JWT token per testing
///
/// # Arguments
/// * `identity` - Identità da mettere nel claim `sub`
/// * `jwt_secret` - Secret key per firmare il token
///
/// # Returns
/// Token JWT valido per 24 ore
pub fn create_test_jwt(identity: &str, jwt_secret: &str) -> String {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Claims {
        sub: String,
        exp: usize,
        iat: usize,
    }

    let now = Utc::now();
    let expiration = now
        .checked_add_signed(Duration::hours(24))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: identity.to_string(),
        exp: expiration,
        iat: now.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .expect("Failed to create JWT token")
}

/// Valore dell'header Authorization per `identity`
pub fn bearer(identity: &str) -> String {
    format!("Bearer {}", create_test_jwt(identity, JWT_SECRET))
}
