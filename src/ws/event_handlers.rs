//! WebSocket Event Handlers - Handler per eventi WebSocket
//!
//! Ogni evento viene validato al confine del protocollo, poi tradotto in
//! un'operazione della façade. Gli errori tornano solo alla connessione che
//! ha inviato l'evento, come evento `error`.

use crate::AppState;
use crate::core::SyncError;
use crate::dtos::{ClientEvent, ServerEvent, TypingDTO};
use crate::entities::Message;
use crate::repositories::MessageStore;
use crate::sync::ConnId;
use tracing::{debug, instrument, warn};

#[instrument(skip(state, event), fields(event = event.name()))]
pub async fn process_event(state: &AppState, handle: ConnId, event: ClientEvent) {
    let result = match event.validate() {
        Ok(()) => dispatch(state, handle, event).await,
        Err(e) => Err(e.into()),
    };

    if let Err(reply) = result {
        warn!(?reply, "Event rejected");
        state.sync.send_to(handle, reply);
    }
}

async fn dispatch(state: &AppState, handle: ConnId, event: ClientEvent) -> Result<(), ServerEvent> {
    let sync = &state.sync;
    match event {
        ClientEvent::JoinChat(conversation_id) => join_chat(state, handle, conversation_id).await,
        ClientEvent::LeaveChat(conversation_id) => {
            sync.leave_conversation(handle, conversation_id);
            Ok(())
        }
        ClientEvent::SendMessage(message) => send_message(state, handle, message).await,
        ClientEvent::JoinUserRoom(identity) => {
            sync.announce_presence(handle, &identity)?;
            Ok(())
        }
        ClientEvent::LeaveUserRoom(identity) => {
            sync.withdraw_presence(handle, &identity)?;
            Ok(())
        }
        ClientEvent::RequestPresence(identities) => {
            let snapshot = sync.request_presence_snapshot(&identities)?;
            sync.send_to(handle, ServerEvent::PresenceSnapshot(snapshot));
            Ok(())
        }
        ClientEvent::NotifyChat(identities) => {
            sync.notify_inbox(&identities);
            Ok(())
        }
        ClientEvent::Typing(TypingDTO { conversation_id, identity }) => {
            sync.typing(handle, conversation_id, &identity, true)?;
            Ok(())
        }
        ClientEvent::StopTyping(TypingDTO { conversation_id, identity }) => {
            sync.typing(handle, conversation_id, &identity, false)?;
            Ok(())
        }
    }
}

/// Handler per join_chat
/// Operazioni:
/// 1. Verificare che la connessione sia autenticata
/// 2. Verificare che il principal sia partecipante della conversazione
/// 3. Iscrivere la connessione al canale della conversazione
async fn join_chat(state: &AppState, handle: ConnId, conversation_id: i64) -> Result<(), ServerEvent> {
    let principal = state.sync.principal(handle).ok_or_else(|| {
        ServerEvent::from(SyncError::Unauthenticated(
            "Connection has no authenticated identity",
        ))
    })?;

    if !state.store.is_participant(conversation_id, &principal).await? {
        return Err(ServerEvent::rejected("Not a participant of this conversation"));
    }
    state.sync.join_conversation(handle, conversation_id)?;
    Ok(())
}

/// Handler per send_message
/// Il messaggio è già stato reso durevole dal client tramite POST /chats/{id}/messages:
/// qui si inoltra agli altri membri del canale la copia letta dallo store, non quella
/// arrivata dal client.
async fn send_message(state: &AppState, handle: ConnId, message: Message) -> Result<(), ServerEvent> {
    let principal = state.sync.principal(handle);
    if principal.as_deref() != Some(message.sender_id.as_str()) {
        return Err(ServerEvent::rejected("Sender does not match authenticated identity"));
    }
    if !state
        .store
        .is_participant(message.conversation_id, &message.sender_id)
        .await?
    {
        return Err(ServerEvent::rejected("Not a participant of this conversation"));
    }

    let stored = state
        .store
        .message(message.conversation_id, message.message_id)
        .await?
        .ok_or(SyncError::NotFound("Message not persisted"))?;
    if stored.sender_id != message.sender_id {
        return Err(ServerEvent::rejected("Sender does not match authenticated identity"));
    }
    if stored != message {
        debug!(message_id = stored.message_id, "Relaying stored copy instead of client payload");
    }

    state.sync.broadcast_message(&stored, Some(handle));
    Ok(())
}
