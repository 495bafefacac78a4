//! Message Store contract
//!
//! This module defines the interface of the durable log consumed by the
//! synchronization core. The core never writes to storage from the live path:
//! every mutation goes through these request/response calls.

use crate::core::SyncError;
use crate::dtos::{CreateConversationDTO, CreateMessageDTO};
use crate::entities::{Conversation, ConversationSummary, Identity, Message, SortKey};
use chrono::{DateTime, Utc};
use std::future::Future;

/// Durable, ordered log of messages per conversation.
///
/// Every operation is transactional with respect to a single call: a message
/// insert and the matching conversation summary update succeed or fail together.
pub trait MessageStore: Send + Sync {
    /// Creates a conversation with the given participants
    ///
    /// # Returns
    /// * `Ok(Conversation)` - New conversation, or the existing one for a private pair
    /// * `Err(SyncError)` - Error during insertion
    fn create_conversation(
        &self,
        data: &CreateConversationDTO,
    ) -> impl Future<Output = Result<Conversation, SyncError>> + Send;

    /// Reads a conversation by primary key
    ///
    /// # Returns
    /// * `Ok(Some(Conversation))` - Conversation found
    /// * `Ok(None)` - No conversation with that ID
    fn conversation(
        &self,
        conversation_id: i64,
    ) -> impl Future<Output = Result<Option<Conversation>, SyncError>> + Send;

    /// Lists every participant of a conversation (empty if it does not exist)
    fn participants(
        &self,
        conversation_id: i64,
    ) -> impl Future<Output = Result<Vec<Identity>, SyncError>> + Send;

    fn is_participant(
        &self,
        conversation_id: i64,
        identity: &str,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send;

    /// Renames a conversation. `updated_at` is left alone: renaming does not
    /// move the conversation in anyone's list.
    ///
    /// # Returns
    /// * `Ok(Conversation)` - The conversation with its new name
    /// * `Err(SyncError::NotFound)` - No conversation with that ID
    fn rename_conversation(
        &self,
        conversation_id: i64,
        name: &str,
    ) -> impl Future<Output = Result<Conversation, SyncError>> + Send;

    /// Deletes a group conversation with its participants, messages and attachments
    ///
    /// # Returns
    /// * `Err(SyncError::NotFound)` - No conversation with that ID
    /// * `Err(SyncError::InvalidArgument)` - Private conversations cannot be deleted
    fn delete_conversation(
        &self,
        conversation_id: i64,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Inserts a message and returns the persisted record
    ///
    /// The store assigns `message_id` and `created_at`, updates the conversation's
    /// `last_message` summary and bumps its `updated_at`.
    ///
    /// # Returns
    /// * `Ok(Message)` - Persisted message, attachments included
    /// * `Err(SyncError::NotFound)` - The conversation does not exist
    fn insert_message(
        &self,
        data: &CreateMessageDTO,
    ) -> impl Future<Output = Result<Message, SyncError>> + Send;

    /// Reads a persisted message, attachments included
    ///
    /// # Returns
    /// * `Ok(None)` - The message does not exist or belongs to another conversation
    fn message(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> impl Future<Output = Result<Option<Message>, SyncError>> + Send;

    /// Looks up the sort key of a message inside a conversation
    ///
    /// # Returns
    /// * `Ok(None)` - The message does not exist or belongs to another conversation
    fn message_key(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> impl Future<Output = Result<Option<SortKey>, SyncError>> + Send;

    /// Reads up to `limit` messages strictly older than `before`, newest first
    ///
    /// # Arguments
    /// * `before` - Exclusive upper bound, `None` starts from the newest message
    fn messages_before(
        &self,
        conversation_id: i64,
        before: Option<SortKey>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Message>, SyncError>> + Send;

    /// Looks up the sort key of a conversation inside the list of `identity`
    ///
    /// # Returns
    /// * `Ok(None)` - Not a conversation of `identity`, or one without messages
    fn conversation_key(
        &self,
        identity: &str,
        conversation_id: i64,
    ) -> impl Future<Output = Result<Option<SortKey>, SyncError>> + Send;

    /// Reads up to `limit` conversations of `identity` strictly older than `before`,
    /// most recently updated first. Conversations without messages are skipped.
    fn conversations_before(
        &self,
        identity: &str,
        before: Option<SortKey>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, SyncError>> + Send;

    /// Moves the read watermark of `identity` forward to `at` (never backwards)
    ///
    /// # Returns
    /// * `Err(SyncError::NotFound)` - `identity` is not a participant
    fn mark_read(
        &self,
        conversation_id: i64,
        identity: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}
