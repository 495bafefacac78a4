//! Conversation entity - Entità conversazione e partecipanti

use super::{ConversationKind, Identity, SortKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Conversation {
    pub conversation_id: i64,
    pub kind: ConversationKind,
    pub name: Option<String>,
    // riassunto denormalizzato dell'ultimo messaggio accettato
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    // mai decrescente, sempre >= created_at del messaggio più recente
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Participant {
    pub conversation_id: i64,
    pub identity: Identity,
    // watermark di lettura: "ho letto fino a questo istante, istante INCLUSO"
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Riga della lista conversazioni di un utente, arricchita con i contatori
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: i64,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    /// Gli altri partecipanti (l'utente che chiede la lista è escluso)
    pub participants: Vec<Identity>,
}

impl ConversationSummary {
    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.updated_at, self.conversation_id)
    }
}
