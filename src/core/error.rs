use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

/// Errori del core di sincronizzazione.
///
/// I registri in memoria (presenza, stanze, typing) falliscono solo con
/// `InvalidArgument`, `Unauthenticated` o `Forbidden`; `NotFound` e
/// `StoreUnavailable` arrivano dal Message Store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Il cursore punta ad una riga eliminata o inesistente: ricominciare dalla pagina più recente
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// Errore transitorio dello store, il chiamante può riprovare
    #[error("store unavailable")]
    StoreUnavailable,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),

    /// Principal valido ma senza accesso alla risorsa
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Errore non transitorio dello store
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Codice numerico usato negli eventi `error` del websocket
    pub fn code(&self) -> u16 {
        match self {
            SyncError::NotFound(_) => 404,
            SyncError::StoreUnavailable => 503,
            SyncError::InvalidArgument(_) => 400,
            SyncError::Unauthenticated(_) => 401,
            SyncError::Forbidden(_) => 403,
            SyncError::Store(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::StoreUnavailable)
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SyncError::NotFound("Resource not found"),

            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SyncError::StoreUnavailable
            }

            other => SyncError::Store(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: &'static str,
    details: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, message: &'static str) -> Self {
        Self {
            status,
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    // Common error constructors
    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: &'static str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: &'static str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal_server_error(message: &'static str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: &'static str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(what) => Self::not_found(what),
            SyncError::StoreUnavailable => {
                Self::service_unavailable("Store unavailable, try again")
            }
            SyncError::InvalidArgument(what) => Self::bad_request(what),
            SyncError::Unauthenticated(what) => Self::unauthorized(what),
            SyncError::Forbidden(what) => Self::forbidden(what),
            SyncError::Store(details) => {
                Self::internal_server_error("Internal server error").with_details(details)
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::from(err).into()
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::bad_request("Validation error").with_details(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ErrorResponse {
            error: self.message,
            details: self.details,
        });
        (self.status, body).into_response()
    }
}
