//! Entities module - Entità del dominio applicativo
//!
//! Questo modulo contiene le entità persistite dal Message Store (conversazioni,
//! partecipanti, messaggi, allegati) e la chiave di ordinamento usata dalla
//! paginazione a cursore.

pub mod conversation;
pub mod enums;
pub mod message;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Re-exports per facilitare l'import
pub use conversation::{Conversation, ConversationSummary, Participant};
pub use enums::ConversationKind;
pub use message::{Attachment, Message};

/// Identificativo opaco di un utente. Il core non possiede altri attributi dell'utente.
pub type Identity = String;

/// Chiave di ordinamento di una riga paginabile: (istante, id).
///
/// Il confronto è lessicografico, quindi due righe con lo stesso istante restano
/// comunque strettamente ordinate dall'id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    pub at: DateTime<Utc>,
    pub id: i64,
}

impl SortKey {
    pub fn new(at: DateTime<Utc>, id: i64) -> Self {
        Self { at, id }
    }
}
