//! DTOs module - Data Transfer Objects
//!
//! Questo modulo contiene tutti i DTOs usati per la comunicazione client-server,
//! sia per le rotte HTTP (scritture durevoli, paginazione) sia per il protocollo
//! websocket (eventi tipizzati, validati prima di raggiungere i registri).

pub mod conversation;
pub mod message;
pub mod query;
pub mod validation;
pub mod ws_event;

// Re-exports per facilitare l'import
pub use conversation::{CreateConversationDTO, UpdateConversationDTO};
pub use message::{CreateAttachmentDTO, CreateMessageDTO, SendMessageDTO};
pub use query::PageQuery;
pub use validation::{validate_identities, validate_identity};
pub use ws_event::{ClientEvent, ServerEvent, TypingDTO};
