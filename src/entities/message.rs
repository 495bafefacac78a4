//! Message entity - Entità messaggio

use super::{Identity, SortKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messaggio persistito. Immutabile una volta creato.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: i64,
    pub conversation_id: i64,
    pub sender_id: Identity,
    // None quando il messaggio contiene solo allegati
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    // assegnato dallo store, concorda con l'ordine degli id all'interno della conversazione
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.created_at, self.message_id)
    }
}

/// Riferimento ad un oggetto binario salvato altrove (lo storage dei file è esterno)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Attachment {
    pub attachment_id: i64,
    pub url: String,
    pub name: String,
    // campo rinominato perchè type è una parola protetta
    pub kind: String,
}
