use crate::core::{AppError, AppState};
use crate::dtos::validate_identity;
use crate::entities::Identity;
use crate::repositories::MessageStore;
use axum::extract::State;
use axum::{Error, body::Body, extract::Request, http, http::Response, middleware::Next};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, TokenData, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

// struct che codifica il contenuto del token jwt
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub exp: usize, // Expiry time of the token
    pub iat: usize, // Issued at time of the token
    pub sub: Identity,
}

/// Identità autenticata della richiesta, inserita nelle Extension dal middleware
#[derive(Debug, Clone, PartialEq)]
pub struct Principal(pub Identity);

#[instrument(skip(secret))]
pub fn encode_jwt(identity: &str, secret: &str) -> Result<String, Error> {
    debug!("Encoding JWT token for identity");
    let now = Utc::now();
    let expire: chrono::TimeDelta = Duration::hours(24);
    let claim = Claims {
        iat: now.timestamp() as usize,
        exp: (now + expire).timestamp() as usize,
        sub: identity.to_string(),
    };

    encode(
        &Header::default(),
        &claim,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Failed to encode JWT token: {:?}", e);
        Error::new("Error in encoding jwt token")
    })
}

#[instrument(skip(jwt_token, secret))]
pub fn decode_jwt(jwt_token: &str, secret: &str) -> Result<TokenData<Claims>, Error> {
    debug!("Decoding JWT token");
    decode::<Claims>(
        jwt_token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| {
        debug!("JWT token decoded for identity: {}", data.claims.sub);
        data
    })
    .map_err(|e| {
        warn!("Failed to decode JWT token: {:?}", e);
        Error::new("Error in decoding jwt token")
    })
}

/// Verifica il token Bearer e inserisce il `Principal` nelle Extension.
/// L'identità è opaca: non c'è un'anagrafica utenti da consultare.
#[instrument(skip(state, req, next))]
pub async fn authentication_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response<Body>, AppError> {
    debug!("Running authentication middleware");
    let auth_header = match req.headers().get(http::header::AUTHORIZATION) {
        Some(header) => header.to_str().map_err(|_| {
            warn!("Invalid authorization header format");
            AppError::unauthorized("Invalid authorization header")
        })?,
        None => {
            warn!("Missing authorization header");
            return Err(AppError::unauthorized(
                "Please add the JWT token to the header",
            ));
        }
    };

    let mut header = auth_header.split_whitespace();
    let token = match (header.next(), header.next()) {
        (Some("Bearer"), Some(token)) => token,
        _ => {
            warn!("Malformed authorization header");
            return Err(AppError::unauthorized("Expected a Bearer token"));
        }
    };

    let token_data = decode_jwt(token, &state.jwt_secret)
        .map_err(|_| AppError::unauthorized("Unable to decode token"))?;

    let identity = token_data.claims.sub;
    validate_identity(&identity).map_err(|_| {
        warn!("Token carries a malformed identity");
        AppError::unauthorized("You are not an authorized user")
    })?;

    info!("Identity authenticated: {}", identity);
    req.extensions_mut().insert(Principal(identity));
    Ok(next.run(req).await)
}

/// Middleware che verifica che il principal sia partecipante della conversazione
/// indicata nel path. Va montato dopo `authentication_middleware`.
#[instrument(skip(state, req, next))]
pub async fn conversation_membership_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response<Body>, AppError> {
    debug!("Running conversation membership middleware");
    // 1. Principal inserito dall'authentication_middleware
    let Principal(identity) = req
        .extensions()
        .get::<Principal>()
        .ok_or_else(|| {
            warn!("Principal not found in request extensions");
            AppError::unauthorized("User not authenticated")
        })?
        .clone();

    // 2. conversation_id dal path
    let conversation_id: i64 = req
        .uri()
        .path()
        .split('/')
        .find_map(|segment| segment.parse::<i64>().ok())
        .ok_or_else(|| {
            warn!("Conversation ID not found in path: {}", req.uri().path());
            AppError::bad_request("Conversation ID not found in path")
        })?;

    // 3. la conversazione esiste e il principal ne fa parte
    if state.store.conversation(conversation_id).await?.is_none() {
        warn!(conversation_id, "Conversation not found");
        return Err(AppError::not_found("Conversation not found"));
    }
    if !state.store.is_participant(conversation_id, &identity).await? {
        warn!("{} is not a participant of conversation {}", identity, conversation_id);
        return Err(AppError::forbidden("You are not a participant of this conversation"));
    }

    debug!("{} verified as participant of conversation {}", identity, conversation_id);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_carries_the_identity() {
        let token = encode_jwt("alice@example.com", "secret").expect("token encoded");
        let data = decode_jwt(&token, "secret").expect("token decoded");
        assert_eq!(data.claims.sub, "alice@example.com");
        assert!(data.claims.exp > data.claims.iat);
    }

    #[test]
    fn token_signed_with_another_secret_is_refused() {
        let token = encode_jwt("alice", "secret").expect("token encoded");
        assert!(decode_jwt(&token, "other-secret").is_err());
        assert!(decode_jwt("not.a.token", "secret").is_err());
    }
}
