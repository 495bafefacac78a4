//! Presence Registry - Presenza online derivata dalle connessioni
//!
//! Un'identità è online se e solo se ha almeno una connessione registrata.
//! La presenza è quindi un booleano con conteggio dei riferimenti, non un flag
//! "last write wins": più schede dello stesso utente non generano eventi
//! duplicati e la chiusura di una sola scheda non lo fa risultare offline.

use super::lock;
use super::rooms::ConnId;
use crate::core::SyncError;
use crate::dtos::validate_identity;
use crate::entities::Identity;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, info, instrument};

pub const PRESENCE_FEED_CAPACITY: usize = 1024;

/// Transizione di presenza (offline -> online o viceversa), anche riga di snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub identity: Identity,
    pub online: bool,
}

pub struct PresenceRegistry {
    /// Key: identity, Value: connessioni vive. Mai insiemi vuoti nella mappa.
    online: Mutex<HashMap<Identity, HashSet<ConnId>>>,
    transitions: Sender<PresenceChange>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(PRESENCE_FEED_CAPACITY);
        PresenceRegistry {
            online: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    /// Registra `handle` per `identity`.
    ///
    /// Restituisce `true` solo sulla transizione 0 -> 1, l'unica che emette un evento.
    /// Idempotente se la connessione era già registrata.
    #[instrument(skip(self))]
    pub fn connect(&self, identity: &str, handle: ConnId) -> Result<bool, SyncError> {
        validate_identity(identity)?;

        let mut online = lock(&self.online);
        let handles = online.entry(identity.to_string()).or_default();
        let was_offline = handles.is_empty();
        handles.insert(handle);

        if was_offline {
            info!("Identity went online");
            // emesso sotto lock: le transizioni di una stessa identità restano ordinate
            self.emit(identity, true);
        } else {
            debug!(connections = handles.len(), "Additional connection registered");
        }
        Ok(was_offline)
    }

    /// Rimuove `handle` da `identity`.
    ///
    /// Restituisce `true` solo sulla transizione N -> 0. Una connessione mai
    /// registrata (o già rimossa) è un no-op, così un doppio segnale di chiusura
    /// non decrementa due volte.
    #[instrument(skip(self))]
    pub fn disconnect(&self, identity: &str, handle: ConnId) -> bool {
        let mut online = lock(&self.online);
        let Some(handles) = online.get_mut(identity) else {
            return false;
        };
        if !handles.remove(&handle) {
            return false;
        }
        if !handles.is_empty() {
            debug!(connections = handles.len(), "Connection removed, identity still online");
            return false;
        }

        online.remove(identity);
        info!("Identity went offline");
        self.emit(identity, false);
        true
    }

    pub fn is_online(&self, identity: &str) -> bool {
        lock(&self.online).contains_key(identity)
    }

    /// Numero di connessioni vive per `identity`
    pub fn connection_count(&self, identity: &str) -> usize {
        lock(&self.online).get(identity).map_or(0, HashSet::len)
    }

    pub fn online_count(&self) -> usize {
        lock(&self.online).len()
    }

    /// Stato attuale delle identità richieste, nell'ordine richiesto e senza duplicati
    pub fn snapshot(&self, identities: &[Identity]) -> Vec<PresenceChange> {
        let online = lock(&self.online);
        let mut seen = HashSet::new();
        identities
            .iter()
            .filter(|identity| seen.insert(identity.as_str()))
            .map(|identity| PresenceChange {
                identity: identity.clone(),
                online: online.contains_key(identity),
            })
            .collect()
    }

    /// Feed delle transizioni. Il receiver va tenuto dalla connessione e
    /// viene rilasciato con essa. Chi si iscrive prima di chiedere uno `snapshot`
    /// non perde transizioni: quelle successive alla lettura arrivano dal feed.
    pub fn subscribe(&self) -> Receiver<PresenceChange> {
        self.transitions.subscribe()
    }

    fn emit(&self, identity: &str, online: bool) {
        let change = PresenceChange {
            identity: identity.to_string(),
            online,
        };
        if let Err(e) = self.transitions.send(change) {
            // nessuno in ascolto, la transizione è comunque registrata nella mappa
            debug!("No presence subscribers: {:?}", e.0);
        }
    }
}
