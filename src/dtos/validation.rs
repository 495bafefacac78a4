//! Validazione condivisa dal protocollo websocket e dai DTO HTTP

use crate::core::SyncError;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use validator::ValidationError;

/// Numero massimo di identità accettate in una singola richiesta (presence, notify)
pub const MAX_IDENTITIES_PER_REQUEST: usize = 500;

lazy_static! {
    // gli id sono opachi, ma li vogliamo stampabili e senza spazi
    static ref IDENTITY_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_.@:\-]{1,128}$").expect("identity regex is valid");
}

pub fn validate_identity(identity: &str) -> Result<(), SyncError> {
    if identity.is_empty() {
        return Err(SyncError::InvalidArgument("Identity must not be empty"));
    }
    if !IDENTITY_RE.is_match(identity) {
        return Err(SyncError::InvalidArgument("Malformed identity"));
    }
    Ok(())
}

pub fn validate_identities(identities: &[String]) -> Result<(), SyncError> {
    if identities.len() > MAX_IDENTITIES_PER_REQUEST {
        return Err(SyncError::InvalidArgument("Too many identities in a single request"));
    }
    identities.iter().try_for_each(|id| validate_identity(id))
}

/// Validatore custom per `validator`: ogni partecipante deve essere un'identità valida
pub fn validate_participants(participants: &Vec<String>) -> Result<(), ValidationError> {
    if validate_identities(participants).is_err() {
        return Err(ValidationError::new("invalid_participant")
            .with_message("Participants must be valid identities".into()));
    }
    let unique: BTreeSet<&String> = participants.iter().collect();
    if unique.len() < 2 {
        return Err(ValidationError::new("too_few_participants")
            .with_message("A conversation needs at least two distinct participants".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rules() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("user_42@example.org").is_ok());
        assert_eq!(
            validate_identity(""),
            Err(SyncError::InvalidArgument("Identity must not be empty"))
        );
        assert!(validate_identity("has space").is_err());
        assert!(validate_identity(&"x".repeat(129)).is_err());
    }

    #[test]
    fn participants_need_two_distinct_entries() {
        assert!(validate_participants(&vec!["alice".into(), "bob".into()]).is_ok());
        assert!(validate_participants(&vec!["alice".into(), "alice".into()]).is_err());
        assert!(validate_participants(&vec!["alice".into(), "".into()]).is_err());
    }
}
