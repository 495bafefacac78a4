//! Message DTOs - Data Transfer Objects per messaggi

use crate::entities::Identity;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Riferimento ad un file già caricato sullo storage esterno
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Validate)]
pub struct CreateAttachmentDTO {
    #[validate(length(min = 1, max = 2048))]
    pub url: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub kind: String,
}

/// Body di POST /chats/{id}/messages
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
#[validate(schema(function = "validate_has_body"))]
pub struct SendMessageDTO {
    #[validate(length(max = 5000, message = "Message content must be at most 5000 characters"))]
    pub content: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub attachments: Vec<CreateAttachmentDTO>,
}

fn validate_has_body(dto: &SendMessageDTO) -> Result<(), ValidationError> {
    let has_text = dto
        .content
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty());
    if !has_text && dto.attachments.is_empty() {
        return Err(ValidationError::new("empty_message")
            .with_message("A message needs text content or at least one attachment".into()));
    }
    Ok(())
}

/// DTO per creare un nuovo messaggio nello store (senza message_id e created_at,
/// assegnati dallo store)
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateMessageDTO {
    pub conversation_id: i64,
    pub sender_id: Identity,
    pub content: Option<String>,
    pub attachments: Vec<CreateAttachmentDTO>,
}

impl CreateMessageDTO {
    pub fn new(conversation_id: i64, sender_id: Identity, body: SendMessageDTO) -> Self {
        // testo vuoto o di soli spazi equivale a nessun testo
        let content = body.content.filter(|text| !text.trim().is_empty());
        Self {
            conversation_id,
            sender_id,
            content,
            attachments: body.attachments,
        }
    }

    /// Riassunto denormalizzato salvato sulla conversazione
    pub fn summary(&self) -> String {
        match &self.content {
            Some(text) => text.clone(),
            None => "Attachment".to_string(),
        }
    }
}
