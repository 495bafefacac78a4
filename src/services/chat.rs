//! Chat services - Lato durevole: conversazioni, storico, invio e lettura
//!
//! Le scritture passano sempre dallo store prima di toccare la façade live:
//! il broadcast arriva solo dopo che l'insert è andato a buon fine.

use crate::core::{AppError, AppState, Principal};
use crate::dtos::{
    CreateConversationDTO, CreateMessageDTO, PageQuery, SendMessageDTO, UpdateConversationDTO,
};
use crate::entities::{Conversation, ConversationSummary, Identity, Message};
use crate::repositories::MessageStore;
use crate::sync::{ConversationList, MessageLog, Page, page};
use axum::{
    Extension,
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

#[instrument(skip(state, identity, query), fields(identity = %identity))]
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<ConversationSummary>>, AppError> {
    let page_size = query.page_size(state.config.conversation_page_size, state.config.max_page_size);
    debug!(page_size, cursor = ?query.cursor, "Listing conversations");

    let list = ConversationList::new(&state.store, &identity);
    let conversations = page(&list, query.cursor, page_size).await?;

    info!(
        "Retrieved {} conversations (has_more: {})",
        conversations.items.len(),
        conversations.has_more()
    );
    Ok(Json(conversations))
}

#[instrument(skip(state, identity, body), fields(identity = %identity, kind = ?body.kind))]
pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Json(mut body): Json<CreateConversationDTO>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    debug!("Creating conversation");
    // chi crea la conversazione ne fa sempre parte
    if !body.participants.contains(&identity) {
        body.participants.push(identity.clone());
    }
    body.validate()?;

    let conversation = state.store.create_conversation(&body).await?;
    info!(conversation_id = conversation.conversation_id, "Conversation ready");
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[instrument(skip(state, query))]
pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Message>>, AppError> {
    let page_size = query.page_size(state.config.message_page_size, state.config.max_page_size);
    debug!(page_size, cursor = ?query.cursor, "Loading message history");

    let log = MessageLog::new(&state.store, conversation_id);
    // il paginatore restituisce dal più recente, lo storico si mostra dal più vecchio
    let messages = page(&log, query.cursor, page_size).await?.into_ascending();

    info!("Retrieved {} messages", messages.items.len());
    Ok(Json(messages))
}

/// Invio di un messaggio
/// Operazioni:
/// 1. Validare il body (testo o almeno un allegato)
/// 2. Scrittura durevole: messaggio + riassunto della conversazione
/// 3. Broadcast sul canale della conversazione
/// 4. Notifica alle inbox dei partecipanti (lista conversazioni da riordinare)
#[instrument(skip(state, identity, body), fields(identity = %identity))]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Path(conversation_id): Path<i64>,
    Json(body): Json<SendMessageDTO>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    body.validate()?;

    let create = CreateMessageDTO::new(conversation_id, identity, body);
    let message = state.store.insert_message(&create).await?;
    debug!(message_id = message.message_id, "Message persisted");

    // da qui in poi è best-effort: il messaggio è già nel log
    let delivered = state.sync.broadcast_message(&message, None);
    match state.store.participants(conversation_id).await {
        Ok(participants) => {
            state.sync.notify_inbox(&participants);
        }
        Err(e) => warn!("Inbox notification skipped: {}", e),
    }

    info!(message_id = message.message_id, delivered, "Message sent");
    Ok((StatusCode::CREATED, Json(message)))
}

/// Segna come letta la conversazione fino al messaggio più recente.
/// Il watermark non resta mai indietro rispetto al `created_at` dell'ultimo
/// messaggio, anche se l'orologio dello store è avanti rispetto a `Utc::now()`.
#[instrument(skip(state, identity), fields(identity = %identity))]
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let now = Utc::now();
    let newest = state.store.messages_before(conversation_id, None, 1).await?;
    let watermark = newest.first().map_or(now, |m| m.created_at.max(now));

    state
        .store
        .mark_read(conversation_id, &identity, watermark)
        .await?;
    debug!(%watermark, "Conversation marked as read");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Conversation>, AppError> {
    let conversation = state
        .store
        .conversation(conversation_id)
        .await?
        .ok_or_else(|| AppError::not_found("Conversation not found"))?;
    Ok(Json(conversation))
}

/// Gli altri partecipanti della conversazione, escluso chi chiede
#[instrument(skip(state, identity), fields(identity = %identity))]
pub async fn get_participants(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Vec<Identity>>, AppError> {
    let peers: Vec<Identity> = state
        .store
        .participants(conversation_id)
        .await?
        .into_iter()
        .filter(|p| *p != identity)
        .collect();
    debug!("Found {} other participants", peers.len());
    Ok(Json(peers))
}

/// Chi sta scrivendo adesso nella conversazione, in ordine di identità
#[instrument(skip(state))]
pub async fn get_typing(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> Json<Vec<Identity>> {
    Json(state.sync.active_typists(conversation_id))
}

/// Rinomina la conversazione e avvisa le inbox dei partecipanti
#[instrument(skip(state, identity, body), fields(identity = %identity))]
pub async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Path(conversation_id): Path<i64>,
    Json(body): Json<UpdateConversationDTO>,
) -> Result<Json<Conversation>, AppError> {
    body.validate()?;

    let conversation = state
        .store
        .rename_conversation(conversation_id, body.name.trim())
        .await?;
    let participants = state.store.participants(conversation_id).await?;
    state.sync.notify_inbox(&participants);

    info!(name = ?conversation.name, "Conversation renamed");
    Ok(Json(conversation))
}

/// Eliminazione di una conversazione di gruppo
/// Operazioni:
/// 1. Leggere i partecipanti prima che spariscano con la conversazione
/// 2. Eliminazione durevole (le private vengono rifiutate dallo store)
/// 3. Notifica alle inbox dei partecipanti
#[instrument(skip(state, identity), fields(identity = %identity))]
pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Extension(Principal(identity)): Extension<Principal>,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let participants = state.store.participants(conversation_id).await?;
    state.store.delete_conversation(conversation_id).await?;

    let delivered = state.sync.notify_inbox(&participants);
    info!(delivered, "Conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}
