//! Sync Module - Core di sincronizzazione real-time
//!
//! Tiene coerente il log durevole (Message Store, fonte di verità) con il
//! trasporto pub/sub effimero usato per la consegna live:
//! - paginazione a cursore stabile rispetto agli inserimenti concorrenti
//! - presenza derivata dal conteggio delle connessioni di ogni identità
//! - stanze (conversazioni e inbox) con fan-out dei broadcast
//! - indicatori di scrittura con scadenza automatica
//!
//! Presenza, stanze e typing sono singleton di processo senza stato persistito:
//! dopo un riavvio i client si ri-annunciano alla riconnessione.

pub mod facade;
pub mod paginator;
pub mod presence;
pub mod rooms;
pub mod typing;

use std::sync::{Mutex, MutexGuard};

// Re-exports pubblici
pub use facade::LiveSync;
pub use paginator::{ConversationList, Cursor, MessageLog, OrderedSet, Page, page};
pub use presence::{PresenceChange, PresenceRegistry};
pub use rooms::{Channel, ConnId, EventSink, RoomMultiplexer};
pub use typing::TypingCoordinator;

/// Lock di un registro in memoria. Le sezioni critiche non possono lasciare
/// lo stato a metà, quindi un lock avvelenato viene semplicemente recuperato.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
