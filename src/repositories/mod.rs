//! Repositories module - Message Store, il log durevole dei messaggi
//!
//! Il core di sincronizzazione legge e scrive solo attraverso il trait
//! `MessageStore`. Due implementazioni:
//! - `MemoryStore`: in memoria, per i test e per avviare il server senza database
//! - `MySqlStore`: MySQL tramite sqlx, schema in `migrations/`

// ************************* NOTA SU SQLX ************************* //

/*
   Le query usano sqlx::query_as / sqlx::query con bind a run-time, non le macro
   query! / query_as!: le macro vogliono un database raggiungibile (o una cache
   offline) già in compilazione, mentre questo crate deve compilare e girare i test
   anche senza MySQL. Le righe vengono mappate con #[derive(FromRow)].

   Promemoria sul numero di righe:
   .execute(...)        -> INSERT/UPDATE/DELETE, restituisce MySqlQueryResult (last_insert_id)
   .fetch_optional(...) -> zero o una riga
   .fetch_one(...)      -> esattamente una riga (aggregati tipo COUNT)
   .fetch_all(...)      -> Vec di righe
   Liste IN (...) dinamiche: QueryBuilder + separated + push_bind.
*/

pub mod memory;
pub mod mysql;
pub mod traits;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use traits::MessageStore;

use crate::core::SyncError;
use crate::dtos::{CreateConversationDTO, CreateMessageDTO};
use crate::entities::{Conversation, ConversationSummary, Identity, Message, SortKey};
use chrono::{DateTime, Utc};

/// Store scelto all'avvio in base alla configurazione
pub enum Store {
    Memory(MemoryStore),
    MySql(MySqlStore),
}

impl Store {
    pub fn backend(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::MySql(_) => "mysql",
        }
    }
}

impl MessageStore for Store {
    async fn create_conversation(&self, data: &CreateConversationDTO) -> Result<Conversation, SyncError> {
        match self {
            Store::Memory(store) => store.create_conversation(data).await,
            Store::MySql(store) => store.create_conversation(data).await,
        }
    }

    async fn conversation(&self, conversation_id: i64) -> Result<Option<Conversation>, SyncError> {
        match self {
            Store::Memory(store) => store.conversation(conversation_id).await,
            Store::MySql(store) => store.conversation(conversation_id).await,
        }
    }

    async fn participants(&self, conversation_id: i64) -> Result<Vec<Identity>, SyncError> {
        match self {
            Store::Memory(store) => store.participants(conversation_id).await,
            Store::MySql(store) => store.participants(conversation_id).await,
        }
    }

    async fn is_participant(&self, conversation_id: i64, identity: &str) -> Result<bool, SyncError> {
        match self {
            Store::Memory(store) => store.is_participant(conversation_id, identity).await,
            Store::MySql(store) => store.is_participant(conversation_id, identity).await,
        }
    }

    async fn rename_conversation(&self, conversation_id: i64, name: &str) -> Result<Conversation, SyncError> {
        match self {
            Store::Memory(store) => store.rename_conversation(conversation_id, name).await,
            Store::MySql(store) => store.rename_conversation(conversation_id, name).await,
        }
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), SyncError> {
        match self {
            Store::Memory(store) => store.delete_conversation(conversation_id).await,
            Store::MySql(store) => store.delete_conversation(conversation_id).await,
        }
    }

    async fn insert_message(&self, data: &CreateMessageDTO) -> Result<Message, SyncError> {
        match self {
            Store::Memory(store) => store.insert_message(data).await,
            Store::MySql(store) => store.insert_message(data).await,
        }
    }

    async fn message(&self, conversation_id: i64, message_id: i64) -> Result<Option<Message>, SyncError> {
        match self {
            Store::Memory(store) => store.message(conversation_id, message_id).await,
            Store::MySql(store) => store.message(conversation_id, message_id).await,
        }
    }

    async fn message_key(&self, conversation_id: i64, message_id: i64) -> Result<Option<SortKey>, SyncError> {
        match self {
            Store::Memory(store) => store.message_key(conversation_id, message_id).await,
            Store::MySql(store) => store.message_key(conversation_id, message_id).await,
        }
    }

    async fn messages_before(
        &self,
        conversation_id: i64,
        before: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<Message>, SyncError> {
        match self {
            Store::Memory(store) => store.messages_before(conversation_id, before, limit).await,
            Store::MySql(store) => store.messages_before(conversation_id, before, limit).await,
        }
    }

    async fn conversation_key(&self, identity: &str, conversation_id: i64) -> Result<Option<SortKey>, SyncError> {
        match self {
            Store::Memory(store) => store.conversation_key(identity, conversation_id).await,
            Store::MySql(store) => store.conversation_key(identity, conversation_id).await,
        }
    }

    async fn conversations_before(
        &self,
        identity: &str,
        before: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        match self {
            Store::Memory(store) => store.conversations_before(identity, before, limit).await,
            Store::MySql(store) => store.conversations_before(identity, before, limit).await,
        }
    }

    async fn mark_read(&self, conversation_id: i64, identity: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        match self {
            Store::Memory(store) => store.mark_read(conversation_id, identity, at).await,
            Store::MySql(store) => store.mark_read(conversation_id, identity, at).await,
        }
    }
}
