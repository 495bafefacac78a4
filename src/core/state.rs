//! Application State - Stato globale dell'applicazione
//!
//! Contiene il Message Store, la façade di sincronizzazione live e la
//! configurazione condivisa da route, middleware e connessioni websocket.

use super::Config;
use crate::repositories::Store;
use crate::sync::LiveSync;

/// Stato globale dell'applicazione condiviso tra tutte le route e middleware
pub struct AppState {
    /// Log durevole dei messaggi, fonte di verità per lo storico
    pub store: Store,

    /// Presenza, stanze e typing: stato effimero di processo
    pub sync: LiveSync,

    /// Secret key per JWT token
    pub jwt_secret: String,

    pub config: Config,
}

impl AppState {
    /// Crea lo stato a partire dallo store scelto e dalla configurazione.
    /// I registri live partono vuoti: i client si ri-annunciano alla connessione.
    pub fn new(store: Store, config: Config) -> Self {
        Self {
            store,
            sync: LiveSync::new(config.typing_timeout()),
            jwt_secret: config.jwt_secret.clone(),
            config,
        }
    }
}
