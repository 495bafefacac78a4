//! Conversation DTOs - Data Transfer Objects per conversazioni

use super::validation::validate_participants;
use crate::entities::{ConversationKind, Identity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::{Validate, ValidationError};

/// DTO per creare una nuova conversazione (senza conversation_id)
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
#[validate(schema(function = "validate_kind_shape"))]
pub struct CreateConversationDTO {
    #[serde(default)]
    pub kind: ConversationKind,

    #[validate(length(min = 1, max = 100, message = "Name must be between 1 and 100 characters"))]
    pub name: Option<String>,

    #[validate(custom(function = "validate_participants"))]
    pub participants: Vec<Identity>,
}

impl CreateConversationDTO {
    /// Partecipanti senza duplicati, in ordine stabile
    pub fn unique_participants(&self) -> Vec<Identity> {
        self.participants
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// DTO per rinominare una conversazione
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct UpdateConversationDTO {
    #[validate(
        length(min = 1, max = 100, message = "Name must be between 1 and 100 characters"),
        custom(function = "validate_not_blank")
    )]
    pub name: String,
}

fn validate_not_blank(name: &String) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("Name cannot be blank".into()));
    }
    Ok(())
}

fn validate_kind_shape(dto: &CreateConversationDTO) -> Result<(), ValidationError> {
    if dto.kind == ConversationKind::Private && dto.unique_participants().len() != 2 {
        return Err(ValidationError::new("private_pair")
            .with_message("A private conversation has exactly two participants".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(kind: ConversationKind, participants: &[&str]) -> CreateConversationDTO {
        CreateConversationDTO {
            kind,
            name: None,
            participants: participants.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn rename_needs_a_visible_name() {
        let rename = |name: &str| UpdateConversationDTO { name: name.to_string() };
        assert!(rename("Gita").validate().is_ok());
        assert!(rename("").validate().is_err());
        assert!(rename("   ").validate().is_err());
        assert!(rename(&"x".repeat(101)).validate().is_err());
    }

    #[test]
    fn private_requires_exactly_two() {
        assert!(dto(ConversationKind::Private, &["bob", "alice"]).validate().is_ok());
        assert!(dto(ConversationKind::Private, &["a", "b", "c"]).validate().is_err());
        assert!(dto(ConversationKind::Group, &["a", "b", "c"]).validate().is_ok());
    }

    #[test]
    fn duplicates_are_collapsed_and_sorted() {
        let d = dto(ConversationKind::Group, &["carol", "alice", "carol", "bob"]);
        assert_eq!(d.unique_participants(), vec!["alice", "bob", "carol"]);
    }
}
