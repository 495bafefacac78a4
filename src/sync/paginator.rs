//! Cursor Paginator - Paginazione a cursore su insiemi ordinati
//!
//! Una pagina viene chiesta "prima di X": X è sempre la chiave di ordinamento
//! di una riga esistente, mai un offset. Gli inserimenti concorrenti in testa
//! (messaggi nuovi) non spostano quindi il confine di chi sta sfogliando lo
//! storico all'indietro.

use crate::core::SyncError;
use crate::entities::{ConversationSummary, Message, SortKey};
use crate::repositories::MessageStore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, instrument, warn};

/// Token di continuazione opaco: id della riga di confine già vista
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor(i64);

impl Cursor {
    pub fn new(id: i64) -> Self {
        Cursor(id)
    }

    pub fn id(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = SyncError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.trim()
            .parse::<i64>()
            .map(Cursor)
            .map_err(|_| SyncError::InvalidArgument("Malformed cursor"))
    }
}

// sul filo il cursore è una stringa, il client non deve farci aritmetica
impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Assente quando l'insieme è esaurito
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    /// Lo storico messaggi viene mostrato dal più vecchio al più recente
    pub fn into_ascending(mut self) -> Self {
        self.items.reverse();
        self
    }
}

/// Insieme ordinato paginabile all'indietro
pub trait OrderedSet: Send + Sync {
    type Item: Send;

    fn sort_key(item: &Self::Item) -> SortKey;

    /// Chiave di ordinamento della riga `id`, `None` se non appartiene all'insieme
    fn boundary(&self, id: i64) -> impl Future<Output = Result<Option<SortKey>, SyncError>> + Send;

    /// Fino a `limit` righe strettamente più vecchie di `bound`, dalla più recente
    fn older_than(
        &self,
        bound: Option<SortKey>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Self::Item>, SyncError>> + Send;
}

/// Restituisce la pagina successiva di `set` a partire da `cursor`, in ordine decrescente
///
/// # Errors
/// * `InvalidArgument` - `page_size` è zero
/// * `NotFound` - il cursore non punta ad una riga dell'insieme
/// * `StoreUnavailable` - lo store non risponde, si può riprovare
#[instrument(skip(set))]
pub async fn page<O: OrderedSet>(
    set: &O,
    cursor: Option<Cursor>,
    page_size: usize,
) -> Result<Page<O::Item>, SyncError> {
    if page_size == 0 {
        warn!("Rejected page request with zero page size");
        return Err(SyncError::InvalidArgument("Page size must be at least 1"));
    }

    let bound = match cursor {
        Some(cursor) => {
            let key = set.boundary(cursor.id()).await?.ok_or_else(|| {
                warn!("Cursor references a missing row");
                SyncError::NotFound("Cursor boundary not found")
            })?;
            Some(key)
        }
        None => None,
    };

    // una riga in più dice se esiste una pagina successiva
    let rows = set.older_than(bound, page_size + 1).await?;
    let page = cut::<O>(rows, page_size);
    debug!(items = page.items.len(), has_more = page.has_more(), "Page built");
    Ok(page)
}

fn cut<O: OrderedSet>(mut rows: Vec<O::Item>, page_size: usize) -> Page<O::Item> {
    let has_more = rows.len() > page_size;
    rows.truncate(page_size);
    let next_cursor = if has_more {
        rows.last().map(|oldest| Cursor(O::sort_key(oldest).id))
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
    }
}

/// Storico messaggi di una conversazione
pub struct MessageLog<'a, S> {
    store: &'a S,
    conversation_id: i64,
}

impl<'a, S: MessageStore> MessageLog<'a, S> {
    pub fn new(store: &'a S, conversation_id: i64) -> Self {
        Self {
            store,
            conversation_id,
        }
    }
}

impl<S: MessageStore> OrderedSet for MessageLog<'_, S> {
    type Item = Message;

    fn sort_key(item: &Message) -> SortKey {
        item.sort_key()
    }

    async fn boundary(&self, id: i64) -> Result<Option<SortKey>, SyncError> {
        self.store.message_key(self.conversation_id, id).await
    }

    async fn older_than(
        &self,
        bound: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<Message>, SyncError> {
        self.store
            .messages_before(self.conversation_id, bound, limit)
            .await
    }
}

/// Lista conversazioni di un utente, ordinata per ultimo aggiornamento
pub struct ConversationList<'a, S> {
    store: &'a S,
    identity: &'a str,
}

impl<'a, S: MessageStore> ConversationList<'a, S> {
    pub fn new(store: &'a S, identity: &'a str) -> Self {
        Self { store, identity }
    }
}

impl<S: MessageStore> OrderedSet for ConversationList<'_, S> {
    type Item = ConversationSummary;

    fn sort_key(item: &ConversationSummary) -> SortKey {
        item.sort_key()
    }

    async fn boundary(&self, id: i64) -> Result<Option<SortKey>, SyncError> {
        self.store.conversation_key(self.identity, id).await
    }

    async fn older_than(
        &self,
        bound: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        self.store
            .conversations_before(self.identity, bound, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::{CreateConversationDTO, CreateMessageDTO};
    use crate::entities::ConversationKind;
    use crate::repositories::MemoryStore;

    async fn conversation(store: &MemoryStore, a: &str, b: &str) -> i64 {
        store
            .create_conversation(&CreateConversationDTO {
                kind: ConversationKind::Private,
                name: None,
                participants: vec![a.to_string(), b.to_string()],
            })
            .await
            .expect("conversation created")
            .conversation_id
    }

    async fn send(store: &MemoryStore, conversation_id: i64, text: &str) -> Message {
        store
            .insert_message(&CreateMessageDTO {
                conversation_id,
                sender_id: "alice".to_string(),
                content: Some(text.to_string()),
                attachments: vec![],
            })
            .await
            .expect("message inserted")
    }

    fn texts(page: &Page<Message>) -> Vec<String> {
        page.items
            .iter()
            .map(|m| m.content.clone().unwrap_or_default())
            .collect()
    }

    fn labels(range: impl Iterator<Item = usize>) -> Vec<String> {
        range.map(|i| format!("m{}", i)).collect()
    }

    #[tokio::test]
    async fn pages_backward_through_twenty_five_messages() {
        let store = MemoryStore::new();
        let chat = conversation(&store, "alice", "bob").await;
        let mut sent = Vec::new();
        for i in 1..=25 {
            sent.push(send(&store, chat, &format!("m{}", i)).await);
        }
        let log = MessageLog::new(&store, chat);

        let first = page(&log, None, 10).await.expect("first page");
        assert_eq!(texts(&first), labels((16..=25).rev()));
        assert_eq!(first.next_cursor, Some(Cursor::new(sent[15].message_id)));

        let second = page(&log, first.next_cursor, 10).await.expect("second page");
        assert_eq!(texts(&second), labels((6..=15).rev()));
        assert_eq!(second.next_cursor, Some(Cursor::new(sent[5].message_id)));

        let third = page(&log, second.next_cursor, 10).await.expect("third page");
        assert_eq!(texts(&third), labels((1..=5).rev()));
        assert_eq!(third.next_cursor, None);
    }

    #[tokio::test]
    async fn backward_paging_is_stable_under_concurrent_inserts() {
        let store = MemoryStore::new();
        let chat = conversation(&store, "alice", "bob").await;
        for i in 1..=23 {
            send(&store, chat, &format!("m{}", i)).await;
        }
        let log = MessageLog::new(&store, chat);

        let mut history: Vec<Message> = Vec::new();
        let mut cursor = None;
        let mut round = 0;
        loop {
            let current = page(&log, cursor, 4).await.expect("page");
            // nuovi messaggi arrivano in testa mentre si sfoglia lo storico
            send(&store, chat, &format!("late{}", round)).await;
            round += 1;

            let ascending = current.clone().into_ascending();
            let mut older = ascending.items;
            older.extend(history);
            history = older;

            match current.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(texts(&Page { items: history, next_cursor: None }), labels(1..=23));
    }

    #[tokio::test]
    async fn exact_page_size_leaves_no_cursor() {
        let store = MemoryStore::new();
        let chat = conversation(&store, "alice", "bob").await;
        for i in 1..=10 {
            send(&store, chat, &format!("m{}", i)).await;
        }
        let first = page(&MessageLog::new(&store, chat), None, 10)
            .await
            .expect("page");
        assert_eq!(first.items.len(), 10);
        assert!(!first.has_more());
    }

    #[tokio::test]
    async fn empty_log_is_a_valid_page() {
        let store = MemoryStore::new();
        let chat = conversation(&store, "alice", "bob").await;
        let empty = page(&MessageLog::new(&store, chat), None, 10)
            .await
            .expect("page");
        assert!(empty.items.is_empty());
        assert_eq!(empty.next_cursor, None);
    }

    #[tokio::test]
    async fn rejects_zero_page_size_and_unknown_cursor() {
        let store = MemoryStore::new();
        let chat = conversation(&store, "alice", "bob").await;
        let other = conversation(&store, "alice", "carol").await;
        let foreign = send(&store, other, "elsewhere").await;
        let log = MessageLog::new(&store, chat);

        assert!(matches!(
            page(&log, None, 0).await,
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            page(&log, Some(Cursor::new(9999)), 10).await,
            Err(SyncError::NotFound(_))
        ));
        // un id valido ma di un'altra conversazione non è un confine accettabile
        assert!(matches!(
            page(&log, Some(Cursor::new(foreign.message_id)), 10).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn store_outage_is_surfaced_as_retryable() {
        let store = MemoryStore::new();
        let chat = conversation(&store, "alice", "bob").await;
        send(&store, chat, "m1").await;
        store.set_available(false);

        let err = page(&MessageLog::new(&store, chat), None, 10)
            .await
            .expect_err("store is down");
        assert_eq!(err, SyncError::StoreUnavailable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn conversation_list_pages_by_last_update() {
        let store = MemoryStore::new();
        let mut chats = Vec::new();
        for peer in ["bob", "carol", "dave", "erin"] {
            let chat = conversation(&store, "alice", peer).await;
            send(&store, chat, &format!("hi {}", peer)).await;
            chats.push(chat);
        }
        // una conversazione senza messaggi non compare nella lista
        conversation(&store, "alice", "frank").await;
        // bob torna in cima
        send(&store, chats[0], "again").await;

        let list = ConversationList::new(&store, "alice");
        let first = page(&list, None, 3).await.expect("first page");
        let ids: Vec<i64> = first.items.iter().map(|c| c.conversation_id).collect();
        assert_eq!(ids, vec![chats[0], chats[3], chats[2]]);
        assert_eq!(first.next_cursor, Some(Cursor::new(chats[2])));

        let second = page(&list, first.next_cursor, 3).await.expect("second page");
        let ids: Vec<i64> = second.items.iter().map(|c| c.conversation_id).collect();
        assert_eq!(ids, vec![chats[1]]);
        assert!(!second.has_more());
    }

    #[test]
    fn cursor_is_an_opaque_string_on_the_wire() {
        let wire = serde_json::to_string(&Cursor::new(42)).expect("serializes");
        assert_eq!(wire, "\"42\"");
        let back: Cursor = serde_json::from_str("\"42\"").expect("parses");
        assert_eq!(back, Cursor::new(42));
        assert!(serde_json::from_str::<Cursor>("\"abc\"").is_err());
    }
}
