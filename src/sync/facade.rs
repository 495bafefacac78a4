//! Live Sync Façade - Operazioni del protocollo real-time
//!
//! Compone Presence Registry, Room Multiplexer e Typing Coordinator nelle
//! operazioni esposte ai client. Non scrive mai sullo store: chi chiama
//! `broadcast_message` deve aver già reso durevole il messaggio.

use super::presence::{PresenceChange, PresenceRegistry};
use super::rooms::{Channel, ConnId, EventSink, RoomMultiplexer};
use super::typing::TypingCoordinator;
use crate::core::SyncError;
use crate::dtos::{ServerEvent, validate_identities, validate_identity};
use crate::entities::{Identity, Message};
use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Stato per connessione: chi si è autenticato e quale identità ha annunciato
#[derive(Debug, Clone, Default)]
struct Session {
    principal: Option<Identity>,
    announced: Option<Identity>,
}

pub struct LiveSync {
    presence: PresenceRegistry,
    rooms: Arc<RoomMultiplexer>,
    typing: Arc<TypingCoordinator>,
    sessions: DashMap<ConnId, Session>,
}

impl LiveSync {
    pub fn new(typing_timeout: Duration) -> Self {
        let rooms = Arc::new(RoomMultiplexer::new());
        LiveSync {
            presence: PresenceRegistry::new(),
            typing: Arc::new(TypingCoordinator::new(rooms.clone(), typing_timeout)),
            rooms,
            sessions: DashMap::new(),
        }
    }

    /// Registra una nuova connessione con il suo sink in uscita.
    /// `principal` è l'identità verificata dal trasporto, se presente.
    #[instrument(skip(self, sink))]
    pub fn open(&self, principal: Option<Identity>, sink: EventSink) -> ConnId {
        let handle = ConnId::new();
        self.rooms.attach(handle, sink);
        self.sessions.insert(
            handle,
            Session {
                principal,
                announced: None,
            },
        );
        info!(%handle, connections = self.sessions.len(), "Connection opened");
        handle
    }

    pub fn principal(&self, handle: ConnId) -> Option<Identity> {
        self.sessions
            .get(&handle)
            .and_then(|session| session.principal.clone())
    }

    #[instrument(skip(self))]
    pub fn join_conversation(&self, handle: ConnId, conversation_id: i64) -> Result<bool, SyncError> {
        // la sessione resta bloccata fino al join: una disconnect concorrente attende
        let session = self.live_session(handle)?;
        let joined = self.rooms.join(handle, Channel::Conversation(conversation_id));
        drop(session);
        Ok(joined)
    }

    #[instrument(skip(self))]
    pub fn leave_conversation(&self, handle: ConnId, conversation_id: i64) -> bool {
        self.rooms.leave(handle, &Channel::Conversation(conversation_id))
    }

    /// Fan-out di un messaggio già persistito sul canale della sua conversazione
    #[instrument(skip(self, message), fields(conversation_id = message.conversation_id, message_id = message.message_id))]
    pub fn broadcast_message(&self, message: &Message, exclude: Option<ConnId>) -> usize {
        self.rooms.broadcast(
            &Channel::Conversation(message.conversation_id),
            ServerEvent::NewMessage(message.clone()),
            exclude,
        )
    }

    /// Porta online `identity` su questa connessione e la iscrive alla sua inbox.
    /// L'identità deve coincidere con il principal autenticato.
    ///
    /// L'entry della sessione resta bloccata fino all'iscrizione all'inbox, così
    /// una `disconnect` concorrente vede o nulla o tutto e ripulisce sempre.
    #[instrument(skip(self))]
    pub fn announce_presence(&self, handle: ConnId, identity: &str) -> Result<bool, SyncError> {
        validate_identity(identity)?;
        let mut session = self.sessions.get_mut(&handle).ok_or(SyncError::Unauthenticated(
            "Connection has no authenticated identity",
        ))?;
        match session.principal.as_deref() {
            Some(principal) if principal == identity => {}
            Some(_) => {
                warn!("Presence announced for a different identity");
                return Err(SyncError::Unauthenticated(
                    "Identity does not match authenticated principal",
                ));
            }
            None => {
                return Err(SyncError::Unauthenticated(
                    "Connection has no authenticated identity",
                ));
            }
        }

        let went_online = self.presence.connect(identity, handle)?;
        session.announced = Some(identity.to_string());
        self.rooms.join(handle, Channel::Inbox(identity.to_string()));
        drop(session);
        Ok(went_online)
    }

    /// Ritira la presenza annunciata. No-op se la connessione non l'aveva annunciata.
    #[instrument(skip(self))]
    pub fn withdraw_presence(&self, handle: ConnId, identity: &str) -> Result<bool, SyncError> {
        validate_identity(identity)?;
        let announced = match self.sessions.get_mut(&handle) {
            Some(mut session) if session.announced.as_deref() == Some(identity) => {
                session.announced.take()
            }
            _ => None,
        };
        if announced.is_none() {
            return Ok(false);
        }

        self.rooms.leave(handle, &Channel::Inbox(identity.to_string()));
        let went_offline = self.presence.disconnect(identity, handle);
        if went_offline {
            self.typing.clear_connection(handle, Some(identity));
        }
        Ok(went_offline)
    }

    /// Stato attuale, restituito solo a chi lo chiede
    pub fn request_presence_snapshot(
        &self,
        identities: &[Identity],
    ) -> Result<Vec<PresenceChange>, SyncError> {
        validate_identities(identities)?;
        Ok(self.presence.snapshot(identities))
    }

    pub fn subscribe_presence(&self) -> Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.presence.is_online(identity)
    }

    /// Segnala a ogni identità che la sua lista conversazioni va ricaricata
    #[instrument(skip(self, identities), fields(count = identities.len()))]
    pub fn notify_inbox(&self, identities: &[Identity]) -> usize {
        let mut seen = HashSet::new();
        identities
            .iter()
            .filter(|identity| seen.insert(identity.as_str()))
            .map(|identity| {
                self.rooms.broadcast(
                    &Channel::Inbox(identity.clone()),
                    ServerEvent::ConversationUpdated,
                    None,
                )
            })
            .sum()
    }

    /// Inizio o fine scrittura. Si può segnalare solo per il proprio principal e
    /// solo su una conversazione a cui la connessione si è unita con `join_chat`.
    #[instrument(skip(self))]
    pub fn typing(
        &self,
        handle: ConnId,
        conversation_id: i64,
        identity: &str,
        is_typing: bool,
    ) -> Result<bool, SyncError> {
        let session = self.live_session(handle)?;
        if session.principal.as_deref() != Some(identity) {
            return Err(SyncError::Unauthenticated(
                "Identity does not match authenticated principal",
            ));
        }
        if !self
            .rooms
            .is_member(handle, &Channel::Conversation(conversation_id))
        {
            warn!("Typing signal for a conversation the connection has not joined");
            return Err(SyncError::Forbidden("Conversation not joined"));
        }

        let changed = if is_typing {
            self.typing.start_typing(conversation_id, identity, Some(handle))
        } else {
            self.typing.stop_typing(conversation_id, identity, Some(handle))
        };
        drop(session);
        changed
    }

    pub fn active_typists(&self, conversation_id: i64) -> Vec<Identity> {
        self.typing.active_typists(conversation_id)
    }

    /// Consegna diretta alla sola connessione indicata
    pub fn send_to(&self, handle: ConnId, event: ServerEvent) -> bool {
        self.rooms.send_to(handle, event)
    }

    pub fn spawn_typing_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.typing.spawn_sweeper(every)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Chiusura del trasporto. Ordine: stanze, presenza, typing.
    /// Idempotente: un secondo segnale di chiusura non ha effetti.
    #[instrument(skip(self))]
    pub fn disconnect(&self, handle: ConnId) -> bool {
        let Some((_, session)) = self.sessions.remove(&handle) else {
            return false;
        };

        let channels = self.rooms.leave_all(handle);
        let offline_identity = session
            .announced
            .filter(|identity| self.presence.disconnect(identity, handle));
        let cleared = self
            .typing
            .clear_connection(handle, offline_identity.as_deref());

        info!(
            channels = channels.len(),
            went_offline = offline_identity.is_some(),
            typing_flags = cleared,
            connections = self.sessions.len(),
            "Connection closed"
        );
        true
    }

    /// Sessione aperta e autenticata. Il guard va tenuto finché le modifiche ai
    /// registri non sono complete: `disconnect` rimuove la sessione per prima.
    fn live_session(&self, handle: ConnId) -> Result<Ref<'_, ConnId, Session>, SyncError> {
        self.sessions
            .get(&handle)
            .filter(|session| session.principal.is_some())
            .ok_or(SyncError::Unauthenticated(
                "Connection has no authenticated identity",
            ))
    }
}
