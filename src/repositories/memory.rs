//! MemoryStore - Message Store in memoria
//!
//! Usato dai test e quando non è configurato un database. Un solo lock copre
//! tutte le tabelle, quindi ogni operazione è atomica come una transazione.

use super::MessageStore;
use crate::core::SyncError;
use crate::dtos::{CreateConversationDTO, CreateMessageDTO};
use crate::entities::{
    Attachment, Conversation, ConversationKind, ConversationSummary, Identity, Message,
    Participant, SortKey,
};
use crate::sync::lock;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, instrument};

#[derive(Default)]
struct Tables {
    conversations: BTreeMap<i64, Conversation>,
    participants: HashMap<i64, Vec<Participant>>,
    /// Messaggi per conversazione, in ordine crescente di (created_at, message_id)
    messages: HashMap<i64, Vec<Message>>,
    private_pairs: HashMap<(Identity, Identity), i64>,
    last_conversation_id: i64,
    last_message_id: i64,
    last_attachment_id: i64,
    last_tick: Option<DateTime<Utc>>,
}

impl Tables {
    /// Orologio strettamente crescente: ordine degli id e ordine temporale coincidono
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    fn is_participant(&self, conversation_id: i64, identity: &str) -> bool {
        self.participants
            .get(&conversation_id)
            .is_some_and(|members| members.iter().any(|p| p.identity == identity))
    }

    fn find_message(&self, conversation_id: i64, message_id: i64) -> Option<&Message> {
        let log = self.messages.get(&conversation_id)?;
        log.binary_search_by_key(&message_id, |m| m.message_id)
            .ok()
            .map(|index| &log[index])
    }

    fn summary_for(&self, conversation: &Conversation, identity: &str) -> ConversationSummary {
        let members = self
            .participants
            .get(&conversation.conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let last_read_at = members
            .iter()
            .find(|p| p.identity == identity)
            .and_then(|p| p.last_read_at);
        let unread_count = self
            .messages
            .get(&conversation.conversation_id)
            .map_or(0, |log| {
                log.iter()
                    .filter(|m| m.sender_id != identity)
                    .filter(|m| last_read_at.is_none_or(|read| m.created_at > read))
                    .count()
            });

        ConversationSummary {
            conversation_id: conversation.conversation_id,
            kind: conversation.kind,
            name: conversation.name.clone(),
            last_message: conversation.last_message.clone(),
            updated_at: conversation.updated_at,
            last_read_at,
            unread_count: unread_count as i64,
            participants: members
                .iter()
                .filter(|p| p.identity != identity)
                .map(|p| p.identity.clone())
                .collect(),
        }
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simula un'interruzione dello store: ogni operazione fallisce con `StoreUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::StoreUnavailable)
        }
    }
}

impl MessageStore for MemoryStore {
    #[instrument(skip(self, data))]
    async fn create_conversation(&self, data: &CreateConversationDTO) -> Result<Conversation, SyncError> {
        self.check()?;
        let members = data.unique_participants();
        if members.is_empty() {
            return Err(SyncError::InvalidArgument("A conversation needs participants"));
        }

        let mut tables = lock(&self.tables);
        let pair = match data.kind {
            ConversationKind::Private => match members.as_slice() {
                [a, b] => Some((a.clone(), b.clone())),
                _ => {
                    return Err(SyncError::InvalidArgument(
                        "A private conversation has exactly two participants",
                    ));
                }
            },
            ConversationKind::Group => None,
        };

        if let Some(existing) = pair
            .as_ref()
            .and_then(|pair| tables.private_pairs.get(pair))
            .and_then(|id| tables.conversations.get(id))
        {
            debug!(conversation_id = existing.conversation_id, "Private conversation already exists");
            return Ok(existing.clone());
        }

        let now = tables.tick();
        tables.last_conversation_id += 1;
        let conversation = Conversation {
            conversation_id: tables.last_conversation_id,
            kind: data.kind,
            name: data.name.clone(),
            last_message: None,
            created_at: now,
            updated_at: now,
        };
        let id = conversation.conversation_id;

        tables.conversations.insert(id, conversation.clone());
        tables.participants.insert(
            id,
            members
                .into_iter()
                .map(|identity| Participant {
                    conversation_id: id,
                    identity,
                    last_read_at: Some(now),
                })
                .collect(),
        );
        tables.messages.insert(id, Vec::new());
        if let Some(pair) = pair {
            tables.private_pairs.insert(pair, id);
        }
        Ok(conversation)
    }

    async fn conversation(&self, conversation_id: i64) -> Result<Option<Conversation>, SyncError> {
        self.check()?;
        Ok(lock(&self.tables).conversations.get(&conversation_id).cloned())
    }

    async fn participants(&self, conversation_id: i64) -> Result<Vec<Identity>, SyncError> {
        self.check()?;
        Ok(lock(&self.tables)
            .participants
            .get(&conversation_id)
            .map(|members| members.iter().map(|p| p.identity.clone()).collect())
            .unwrap_or_default())
    }

    async fn is_participant(&self, conversation_id: i64, identity: &str) -> Result<bool, SyncError> {
        self.check()?;
        Ok(lock(&self.tables).is_participant(conversation_id, identity))
    }

    #[instrument(skip(self))]
    async fn rename_conversation(&self, conversation_id: i64, name: &str) -> Result<Conversation, SyncError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let conversation = tables
            .conversations
            .get_mut(&conversation_id)
            .ok_or(SyncError::NotFound("Conversation not found"))?;
        conversation.name = Some(name.to_string());
        Ok(conversation.clone())
    }

    #[instrument(skip(self))]
    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), SyncError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        match tables.conversations.get(&conversation_id).map(|c| c.kind) {
            None => return Err(SyncError::NotFound("Conversation not found")),
            Some(ConversationKind::Private) => {
                return Err(SyncError::InvalidArgument("Private conversations cannot be deleted"));
            }
            Some(ConversationKind::Group) => {}
        }
        tables.conversations.remove(&conversation_id);
        tables.participants.remove(&conversation_id);
        tables.messages.remove(&conversation_id);
        debug!(conversation_id, "Conversation deleted");
        Ok(())
    }

    #[instrument(skip(self, data), fields(conversation_id = data.conversation_id))]
    async fn insert_message(&self, data: &CreateMessageDTO) -> Result<Message, SyncError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        if !tables.conversations.contains_key(&data.conversation_id) {
            return Err(SyncError::NotFound("Conversation not found"));
        }

        let created_at = tables.tick();
        tables.last_message_id += 1;
        let message_id = tables.last_message_id;
        let attachments = data
            .attachments
            .iter()
            .map(|a| {
                tables.last_attachment_id += 1;
                Attachment {
                    attachment_id: tables.last_attachment_id,
                    url: a.url.clone(),
                    name: a.name.clone(),
                    kind: a.kind.clone(),
                }
            })
            .collect();

        let message = Message {
            message_id,
            conversation_id: data.conversation_id,
            sender_id: data.sender_id.clone(),
            content: data.content.clone(),
            attachments,
            created_at,
        };

        tables
            .messages
            .entry(data.conversation_id)
            .or_default()
            .push(message.clone());
        if let Some(conversation) = tables.conversations.get_mut(&data.conversation_id) {
            conversation.last_message = Some(data.summary());
            conversation.updated_at = conversation.updated_at.max(created_at);
        }
        Ok(message)
    }

    async fn message(&self, conversation_id: i64, message_id: i64) -> Result<Option<Message>, SyncError> {
        self.check()?;
        Ok(lock(&self.tables)
            .find_message(conversation_id, message_id)
            .cloned())
    }

    async fn message_key(&self, conversation_id: i64, message_id: i64) -> Result<Option<SortKey>, SyncError> {
        self.check()?;
        Ok(lock(&self.tables)
            .find_message(conversation_id, message_id)
            .map(Message::sort_key))
    }

    async fn messages_before(
        &self,
        conversation_id: i64,
        before: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<Message>, SyncError> {
        self.check()?;
        let tables = lock(&self.tables);
        Ok(tables
            .messages
            .get(&conversation_id)
            .map(|log| {
                log.iter()
                    .rev()
                    .filter(|m| before.is_none_or(|bound| m.sort_key() < bound))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn conversation_key(&self, identity: &str, conversation_id: i64) -> Result<Option<SortKey>, SyncError> {
        self.check()?;
        let tables = lock(&self.tables);
        if !tables.is_participant(conversation_id, identity) {
            return Ok(None);
        }
        Ok(tables
            .conversations
            .get(&conversation_id)
            .filter(|c| c.last_message.is_some())
            .map(|c| SortKey::new(c.updated_at, c.conversation_id)))
    }

    async fn conversations_before(
        &self,
        identity: &str,
        before: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        self.check()?;
        let tables = lock(&self.tables);
        let mut rows: Vec<ConversationSummary> = tables
            .conversations
            .values()
            .filter(|c| c.last_message.is_some())
            .filter(|c| tables.is_participant(c.conversation_id, identity))
            .map(|c| tables.summary_for(c, identity))
            .filter(|s| before.is_none_or(|bound| s.sort_key() < bound))
            .collect();
        rows.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        rows.truncate(limit);
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn mark_read(&self, conversation_id: i64, identity: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let participant = tables
            .participants
            .get_mut(&conversation_id)
            .and_then(|members| members.iter_mut().find(|p| p.identity == identity))
            .ok_or(SyncError::NotFound("Participant not found"))?;

        participant.last_read_at = Some(participant.last_read_at.map_or(at, |read| read.max(at)));
        Ok(())
    }
}
