//! WebSocket Event DTOs - Eventi del protocollo real-time
//!
//! Tagged union per eventi WebSocket. Serde serializza come:
//! { "type": "join_chat", "data": 42 }
//! oppure
//! { "type": "typing", "data": { "conversation_id": 42, "identity": "alice" } }

use super::validation::{validate_identities, validate_identity};
use crate::core::SyncError;
use crate::entities::{Identity, Message};
use crate::sync::PresenceChange;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TypingDTO {
    pub conversation_id: i64,
    pub identity: Identity,
}

/// Eventi client -> server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat(i64),
    LeaveChat(i64),
    /// Messaggio già persistito dal client tramite lo store
    SendMessage(Message),
    JoinUserRoom(Identity),
    LeaveUserRoom(Identity),
    RequestPresence(Vec<Identity>),
    NotifyChat(Vec<Identity>),
    Typing(TypingDTO),
    StopTyping(TypingDTO),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat(_) => "join_chat",
            ClientEvent::LeaveChat(_) => "leave_chat",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::JoinUserRoom(_) => "join_user_room",
            ClientEvent::LeaveUserRoom(_) => "leave_user_room",
            ClientEvent::RequestPresence(_) => "request_presence",
            ClientEvent::NotifyChat(_) => "notify_chat",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::StopTyping(_) => "stop_typing",
        }
    }

    /// Validazione al confine del protocollo, prima di toccare qualsiasi registro
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            ClientEvent::JoinChat(id) | ClientEvent::LeaveChat(id) => validate_conversation_id(*id),
            ClientEvent::SendMessage(message) => {
                validate_conversation_id(message.conversation_id)?;
                validate_identity(&message.sender_id)
            }
            ClientEvent::JoinUserRoom(identity) | ClientEvent::LeaveUserRoom(identity) => {
                validate_identity(identity)
            }
            ClientEvent::RequestPresence(identities) | ClientEvent::NotifyChat(identities) => {
                validate_identities(identities)
            }
            ClientEvent::Typing(typing) | ClientEvent::StopTyping(typing) => {
                validate_conversation_id(typing.conversation_id)?;
                validate_identity(&typing.identity)
            }
        }
    }
}

fn validate_conversation_id(id: i64) -> Result<(), SyncError> {
    if id <= 0 {
        return Err(SyncError::InvalidArgument("Conversation id must be positive"));
    }
    Ok(())
}

/// Eventi server -> client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(Message),
    UserPresence(PresenceChange),
    UserTyping(TypingDTO),
    UserStopTyping(TypingDTO),
    /// Segnale senza payload: la lista conversazioni va ricaricata
    ConversationUpdated,
    /// Risposta sincrona a request_presence, solo per chi l'ha chiesta
    PresenceSnapshot(Vec<PresenceChange>),
    Error { code: u16, message: String },
}

impl ServerEvent {
    pub fn error(err: &SyncError) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn rejected(message: &str) -> Self {
        ServerEvent::Error {
            code: 403,
            message: message.to_string(),
        }
    }
}

impl From<SyncError> for ServerEvent {
    fn from(err: SyncError) -> Self {
        ServerEvent::error(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_parse_from_wire_names() {
        let join: ClientEvent = serde_json::from_value(json!({"type": "join_chat", "data": 7}))
            .expect("join_chat parses");
        assert_eq!(join, ClientEvent::JoinChat(7));

        let typing: ClientEvent = serde_json::from_value(json!({
            "type": "stop_typing",
            "data": {"conversation_id": 7, "identity": "alice"}
        }))
        .expect("stop_typing parses");
        assert_eq!(typing.name(), "stop_typing");

        let unknown = serde_json::from_value::<ClientEvent>(json!({"type": "explode", "data": 1}));
        assert!(unknown.is_err());
    }

    #[test]
    fn conversation_updated_has_no_payload() {
        let wire = serde_json::to_value(ServerEvent::ConversationUpdated).expect("serializes");
        assert_eq!(wire, json!({"type": "conversation_updated"}));
    }

    #[test]
    fn validation_rejects_bad_arguments() {
        assert!(ClientEvent::JoinChat(0).validate().is_err());
        assert!(ClientEvent::JoinUserRoom(String::new()).validate().is_err());
        assert!(
            ClientEvent::RequestPresence(vec!["alice".into(), "bob".into()])
                .validate()
                .is_ok()
        );
    }
}
