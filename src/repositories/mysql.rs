//! MySqlStore - Message Store su MySQL
//!
//! Schema in `migrations/`. Le scritture che toccano più tabelle (messaggio,
//! allegati, riassunto della conversazione) girano in un'unica transazione.

use super::MessageStore;
use crate::core::SyncError;
use crate::dtos::{CreateConversationDTO, CreateMessageDTO};
use crate::entities::{
    Attachment, Conversation, ConversationKind, ConversationSummary, Identity, Message, SortKey,
};
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{FromRow, MySql, MySqlPool, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

const CONVERSATION_COLUMNS: &str =
    "conversation_id, kind, name, last_message, created_at, updated_at";

#[derive(FromRow)]
struct MessageRow {
    message_id: i64,
    conversation_id: i64,
    sender_id: String,
    content: Option<String>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self, attachments: Vec<Attachment>) -> Message {
        Message {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            attachments,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct AttachmentRow {
    message_id: i64,
    #[sqlx(flatten)]
    attachment: Attachment,
}

#[derive(FromRow)]
struct SummaryRow {
    conversation_id: i64,
    kind: ConversationKind,
    name: Option<String>,
    last_message: Option<String>,
    updated_at: DateTime<Utc>,
    last_read_at: Option<DateTime<Utc>>,
}

/// Chiave univoca di una conversazione privata: la coppia ordinata dei partecipanti.
/// Gli spazi non sono ammessi nelle identità, quindi il separatore non è ambiguo.
fn private_key(members: &[Identity]) -> Option<String> {
    match members {
        [a, b] => Some(format!("{} {}", a, b)),
        _ => None,
    }
}

pub struct MySqlStore {
    connection_pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(connection_pool: MySqlPool) -> Self {
        Self { connection_pool }
    }

    async fn find_private(&self, key: &str) -> Result<Option<Conversation>, SyncError> {
        let conversation = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {} FROM conversations WHERE private_key = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.connection_pool)
        .await?;
        Ok(conversation)
    }

    /// Carica gli allegati di un insieme di messaggi, raggruppati per messaggio
    async fn attachments_of(&self, message_ids: &[i64]) -> Result<HashMap<i64, Vec<Attachment>>, SyncError> {
        let mut grouped: HashMap<i64, Vec<Attachment>> = HashMap::new();
        if message_ids.is_empty() {
            return Ok(grouped);
        }

        let mut query = QueryBuilder::<MySql>::new(
            "SELECT message_id, attachment_id, url, name, kind FROM message_attachments WHERE message_id IN (",
        );
        let mut ids = query.separated(", ");
        for id in message_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(") ORDER BY attachment_id");

        let rows: Vec<AttachmentRow> = query
            .build_query_as()
            .fetch_all(&self.connection_pool)
            .await?;
        for row in rows {
            grouped.entry(row.message_id).or_default().push(row.attachment);
        }
        Ok(grouped)
    }

    /// Messaggi non letti da `identity` per ciascuna conversazione indicata
    async fn unread_counts(&self, identity: &str, conversation_ids: &[i64]) -> Result<HashMap<i64, i64>, SyncError> {
        if conversation_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query = QueryBuilder::<MySql>::new(
            "SELECT m.conversation_id, COUNT(*) FROM messages m \
             JOIN participants p ON p.conversation_id = m.conversation_id AND p.identity = ",
        );
        query.push_bind(identity);
        query.push(" WHERE m.sender_id <> ");
        query.push_bind(identity);
        query.push(" AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at) AND m.conversation_id IN (");
        let mut ids = query.separated(", ");
        for id in conversation_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(") GROUP BY m.conversation_id");

        let rows: Vec<(i64, i64)> = query
            .build_query_as()
            .fetch_all(&self.connection_pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Gli altri partecipanti di ciascuna conversazione indicata
    async fn peers_of(&self, identity: &str, conversation_ids: &[i64]) -> Result<HashMap<i64, Vec<Identity>>, SyncError> {
        let mut grouped: HashMap<i64, Vec<Identity>> = HashMap::new();
        if conversation_ids.is_empty() {
            return Ok(grouped);
        }

        let mut query = QueryBuilder::<MySql>::new(
            "SELECT conversation_id, identity FROM participants WHERE identity <> ",
        );
        query.push_bind(identity);
        query.push(" AND conversation_id IN (");
        let mut ids = query.separated(", ");
        for id in conversation_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(") ORDER BY identity");

        let rows: Vec<(i64, String)> = query
            .build_query_as()
            .fetch_all(&self.connection_pool)
            .await?;
        for (conversation_id, peer) in rows {
            grouped.entry(conversation_id).or_default().push(peer);
        }
        Ok(grouped)
    }
}

impl MessageStore for MySqlStore {
    #[instrument(skip(self, data))]
    async fn create_conversation(&self, data: &CreateConversationDTO) -> Result<Conversation, SyncError> {
        let members = data.unique_participants();
        if members.is_empty() {
            return Err(SyncError::InvalidArgument("A conversation needs participants"));
        }
        let key = match data.kind {
            ConversationKind::Private => Some(private_key(&members).ok_or(
                SyncError::InvalidArgument("A private conversation has exactly two participants"),
            )?),
            ConversationKind::Group => None,
        };

        if let Some(key) = &key {
            if let Some(existing) = self.find_private(key).await? {
                debug!(conversation_id = existing.conversation_id, "Private conversation already exists");
                return Ok(existing);
            }
        }

        let now = Utc::now().trunc_subsecs(6);
        let mut tx = self.connection_pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO conversations (kind, name, private_key, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(data.kind)
        .bind(&data.name)
        .bind(&key)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let conversation_id = match inserted {
            Ok(result) => result.last_insert_id() as i64,
            // coppia privata creata in parallelo da un'altra richiesta
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tx.rollback().await?;
                warn!("Concurrent private conversation insert, returning existing one");
                let key = key.as_deref().unwrap_or_default();
                return self
                    .find_private(key)
                    .await?
                    .ok_or(SyncError::NotFound("Conversation not found"));
            }
            Err(e) => return Err(e.into()),
        };

        let mut participants = QueryBuilder::<MySql>::new(
            "INSERT INTO participants (conversation_id, identity, last_read_at) ",
        );
        participants.push_values(&members, |mut row, identity| {
            row.push_bind(conversation_id)
                .push_bind(identity)
                .push_bind(now);
        });
        participants.build().execute(&mut *tx).await?;
        tx.commit().await?;

        info!(conversation_id, participants = members.len(), "Conversation created");
        Ok(Conversation {
            conversation_id,
            kind: data.kind,
            name: data.name.clone(),
            last_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn conversation(&self, conversation_id: i64) -> Result<Option<Conversation>, SyncError> {
        let conversation = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {} FROM conversations WHERE conversation_id = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_optional(&self.connection_pool)
        .await?;
        Ok(conversation)
    }

    async fn participants(&self, conversation_id: i64) -> Result<Vec<Identity>, SyncError> {
        let members = sqlx::query_scalar::<_, String>(
            "SELECT identity FROM participants WHERE conversation_id = ? ORDER BY identity",
        )
        .bind(conversation_id)
        .fetch_all(&self.connection_pool)
        .await?;
        Ok(members)
    }

    async fn is_participant(&self, conversation_id: i64, identity: &str) -> Result<bool, SyncError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM participants WHERE conversation_id = ? AND identity = ?",
        )
        .bind(conversation_id)
        .bind(identity)
        .fetch_one(&self.connection_pool)
        .await?;
        Ok(count > 0)
    }

    #[instrument(skip(self))]
    async fn rename_conversation(&self, conversation_id: i64, name: &str) -> Result<Conversation, SyncError> {
        sqlx::query("UPDATE conversations SET name = ? WHERE conversation_id = ?")
            .bind(name)
            .bind(conversation_id)
            .execute(&self.connection_pool)
            .await?;
        self.conversation(conversation_id)
            .await?
            .ok_or(SyncError::NotFound("Conversation not found"))
    }

    #[instrument(skip(self))]
    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), SyncError> {
        let mut tx = self.connection_pool.begin().await?;

        let kind = sqlx::query_scalar::<_, ConversationKind>(
            "SELECT kind FROM conversations WHERE conversation_id = ? FOR UPDATE",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(SyncError::NotFound("Conversation not found"))?;

        if kind == ConversationKind::Private {
            tx.rollback().await?;
            return Err(SyncError::InvalidArgument("Private conversations cannot be deleted"));
        }

        // partecipanti, messaggi e allegati seguono per ON DELETE CASCADE
        sqlx::query("DELETE FROM conversations WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(conversation_id, "Conversation deleted");
        Ok(())
    }

    #[instrument(skip(self, data), fields(conversation_id = data.conversation_id))]
    async fn insert_message(&self, data: &CreateMessageDTO) -> Result<Message, SyncError> {
        let mut tx = self.connection_pool.begin().await?;

        // lock sulla riga della conversazione: gli insert concorrenti si serializzano
        let updated_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT updated_at FROM conversations WHERE conversation_id = ? FOR UPDATE",
        )
        .bind(data.conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(SyncError::NotFound("Conversation not found"))?;

        let created_at = Utc::now().trunc_subsecs(6).max(updated_at);

        let message_id = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(data.conversation_id)
        .bind(&data.sender_id)
        .bind(&data.content)
        .bind(created_at)
        .execute(&mut *tx)
        .await?
        .last_insert_id() as i64;

        let mut attachments = Vec::with_capacity(data.attachments.len());
        for attachment in &data.attachments {
            let attachment_id = sqlx::query(
                "INSERT INTO message_attachments (message_id, url, name, kind) VALUES (?, ?, ?, ?)",
            )
            .bind(message_id)
            .bind(&attachment.url)
            .bind(&attachment.name)
            .bind(&attachment.kind)
            .execute(&mut *tx)
            .await?
            .last_insert_id() as i64;

            attachments.push(Attachment {
                attachment_id,
                url: attachment.url.clone(),
                name: attachment.name.clone(),
                kind: attachment.kind.clone(),
            });
        }

        sqlx::query(
            "UPDATE conversations SET last_message = ?, updated_at = GREATEST(updated_at, ?) WHERE conversation_id = ?",
        )
        .bind(data.summary())
        .bind(created_at)
        .bind(data.conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(message_id, "Message persisted");

        Ok(Message {
            message_id,
            conversation_id: data.conversation_id,
            sender_id: data.sender_id.clone(),
            content: data.content.clone(),
            attachments,
            created_at,
        })
    }

    async fn message(&self, conversation_id: i64, message_id: i64) -> Result<Option<Message>, SyncError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, conversation_id, sender_id, content, created_at \
             FROM messages WHERE conversation_id = ? AND message_id = ?",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_optional(&self.connection_pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let attachments = self
            .attachments_of(&[row.message_id])
            .await?
            .remove(&row.message_id)
            .unwrap_or_default();
        Ok(Some(row.into_message(attachments)))
    }

    async fn message_key(&self, conversation_id: i64, message_id: i64) -> Result<Option<SortKey>, SyncError> {
        let key = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            "SELECT created_at, message_id FROM messages WHERE conversation_id = ? AND message_id = ?",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_optional(&self.connection_pool)
        .await?;
        Ok(key.map(|(at, id)| SortKey::new(at, id)))
    }

    async fn messages_before(
        &self,
        conversation_id: i64,
        before: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<Message>, SyncError> {
        let rows: Vec<MessageRow> = if let Some(bound) = before {
            sqlx::query_as(
                r#"
                SELECT message_id, conversation_id, sender_id, content, created_at
                FROM messages
                WHERE conversation_id = ?
                  AND (created_at < ? OR (created_at = ? AND message_id < ?))
                ORDER BY created_at DESC, message_id DESC
                LIMIT ?
                "#,
            )
            .bind(conversation_id)
            .bind(bound.at)
            .bind(bound.at)
            .bind(bound.id)
            .bind(limit as i64)
            .fetch_all(&self.connection_pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT message_id, conversation_id, sender_id, content, created_at
                FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, message_id DESC
                LIMIT ?
                "#,
            )
            .bind(conversation_id)
            .bind(limit as i64)
            .fetch_all(&self.connection_pool)
            .await?
        };

        let ids: Vec<i64> = rows.iter().map(|row| row.message_id).collect();
        let mut attachments = self.attachments_of(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let own = attachments.remove(&row.message_id).unwrap_or_default();
                row.into_message(own)
            })
            .collect())
    }

    async fn conversation_key(&self, identity: &str, conversation_id: i64) -> Result<Option<SortKey>, SyncError> {
        let key = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            r#"
            SELECT c.updated_at, c.conversation_id
            FROM conversations c
            JOIN participants p ON p.conversation_id = c.conversation_id
            WHERE p.identity = ? AND c.conversation_id = ? AND c.last_message IS NOT NULL
            "#,
        )
        .bind(identity)
        .bind(conversation_id)
        .fetch_optional(&self.connection_pool)
        .await?;
        Ok(key.map(|(at, id)| SortKey::new(at, id)))
    }

    async fn conversations_before(
        &self,
        identity: &str,
        before: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let rows: Vec<SummaryRow> = if let Some(bound) = before {
            sqlx::query_as(
                r#"
                SELECT c.conversation_id, c.kind, c.name, c.last_message, c.updated_at, p.last_read_at
                FROM conversations c
                JOIN participants p ON p.conversation_id = c.conversation_id
                WHERE p.identity = ?
                  AND c.last_message IS NOT NULL
                  AND (c.updated_at < ? OR (c.updated_at = ? AND c.conversation_id < ?))
                ORDER BY c.updated_at DESC, c.conversation_id DESC
                LIMIT ?
                "#,
            )
            .bind(identity)
            .bind(bound.at)
            .bind(bound.at)
            .bind(bound.id)
            .bind(limit as i64)
            .fetch_all(&self.connection_pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT c.conversation_id, c.kind, c.name, c.last_message, c.updated_at, p.last_read_at
                FROM conversations c
                JOIN participants p ON p.conversation_id = c.conversation_id
                WHERE p.identity = ? AND c.last_message IS NOT NULL
                ORDER BY c.updated_at DESC, c.conversation_id DESC
                LIMIT ?
                "#,
            )
            .bind(identity)
            .bind(limit as i64)
            .fetch_all(&self.connection_pool)
            .await?
        };

        let ids: Vec<i64> = rows.iter().map(|row| row.conversation_id).collect();
        let unread = self.unread_counts(identity, &ids).await?;
        let mut peers = self.peers_of(identity, &ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationSummary {
                unread_count: unread.get(&row.conversation_id).copied().unwrap_or(0),
                participants: peers.remove(&row.conversation_id).unwrap_or_default(),
                conversation_id: row.conversation_id,
                kind: row.kind,
                name: row.name,
                last_message: row.last_message,
                updated_at: row.updated_at,
                last_read_at: row.last_read_at,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_read(&self, conversation_id: i64, identity: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        if !self.is_participant(conversation_id, identity).await? {
            return Err(SyncError::NotFound("Participant not found"));
        }
        sqlx::query(
            "UPDATE participants SET last_read_at = GREATEST(COALESCE(last_read_at, ?), ?) \
             WHERE conversation_id = ? AND identity = ?",
        )
        .bind(at)
        .bind(at)
        .bind(conversation_id)
        .bind(identity)
        .execute(&self.connection_pool)
        .await?;
        Ok(())
    }
}
