//! Room Multiplexer - Canali nominati e fan-out verso le connessioni
//!
//! Ogni connessione registra un sink (lato tx di un canale mpsc verso il suo
//! task di scrittura) e si iscrive a un numero qualsiasi di canali:
//! - `conversation:<id>` per i messaggi e il typing di una conversazione
//! - `inbox:<identity>` per le notifiche "lista conversazioni cambiata"
//!
//! Un solo lock copre membri e sink, così un broadcast vede uno stato coerente
//! e due broadcast sullo stesso canale non si intercalano.

use super::lock;
use crate::dtos::ServerEvent;
use crate::entities::Identity;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lato di invio verso il task writer di una connessione.
/// Arc<ServerEvent> per condividere l'evento tra i destinatari senza copiarlo.
pub type EventSink = UnboundedSender<Arc<ServerEvent>>;

/// Handle opaco di una connessione viva
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        ConnId(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Conversation(i64),
    Inbox(Identity),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Conversation(id) => write!(f, "conversation:{}", id),
            Channel::Inbox(identity) => write!(f, "inbox:{}", identity),
        }
    }
}

#[derive(Default)]
struct Rooms {
    members: HashMap<Channel, HashSet<ConnId>>,
    joined: HashMap<ConnId, HashSet<Channel>>,
    sinks: HashMap<ConnId, EventSink>,
}

#[derive(Default)]
pub struct RoomMultiplexer {
    rooms: Mutex<Rooms>,
}

impl RoomMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra il sink della connessione. Va fatto prima di qualsiasi join.
    #[instrument(skip(self, sink))]
    pub fn attach(&self, handle: ConnId, sink: EventSink) {
        let mut rooms = lock(&self.rooms);
        rooms.sinks.insert(handle, sink);
        debug!(connections = rooms.sinks.len(), "Sink attached");
    }

    /// Iscrive `handle` a `channel`. Restituisce `false` se era già iscritto.
    #[instrument(skip(self))]
    pub fn join(&self, handle: ConnId, channel: Channel) -> bool {
        let mut rooms = lock(&self.rooms);
        let added = rooms.members.entry(channel.clone()).or_default().insert(handle);
        if added {
            rooms.joined.entry(handle).or_default().insert(channel);
            info!("Joined channel");
        }
        added
    }

    /// Disiscrive `handle` da `channel`. Canali vuoti vengono rimossi.
    #[instrument(skip(self))]
    pub fn leave(&self, handle: ConnId, channel: &Channel) -> bool {
        let mut rooms = lock(&self.rooms);
        let removed = Self::remove_member(&mut rooms, handle, channel);
        if let Some(channels) = rooms.joined.get_mut(&handle) {
            channels.remove(channel);
            if channels.is_empty() {
                rooms.joined.remove(&handle);
            }
        }
        if removed {
            info!("Left channel");
        }
        removed
    }

    /// Consegna `event` a tutti i membri di `channel` tranne `exclude`.
    ///
    /// Restituisce il numero di sink che hanno accettato l'evento. Un sink chiuso
    /// (connessione in chiusura) viene solo loggato: la pulizia arriva da `leave_all`.
    #[instrument(skip(self, event))]
    pub fn broadcast(&self, channel: &Channel, event: ServerEvent, exclude: Option<ConnId>) -> usize {
        let rooms = lock(&self.rooms);
        let Some(members) = rooms.members.get(channel) else {
            debug!("Broadcast on channel without members");
            return 0;
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        for handle in members.iter().filter(|h| Some(**h) != exclude) {
            match rooms.sinks.get(handle) {
                Some(sink) => match sink.send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => warn!(%handle, "Sink closed, event dropped"),
                },
                None => warn!(%handle, "Member without sink"),
            }
        }
        debug!(delivered, "Event broadcast");
        delivered
    }

    /// Consegna diretta a una singola connessione (risposte sincrone, errori)
    pub fn send_to(&self, handle: ConnId, event: ServerEvent) -> bool {
        let rooms = lock(&self.rooms);
        match rooms.sinks.get(&handle) {
            Some(sink) => sink.send(Arc::new(event)).is_ok(),
            None => false,
        }
    }

    /// Rimuove la connessione da tutti i canali e scarta il suo sink.
    /// Idempotente: la seconda chiamata restituisce un vettore vuoto.
    #[instrument(skip(self))]
    pub fn leave_all(&self, handle: ConnId) -> Vec<Channel> {
        let mut rooms = lock(&self.rooms);
        rooms.sinks.remove(&handle);
        let channels: Vec<Channel> = rooms
            .joined
            .remove(&handle)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for channel in &channels {
            Self::remove_member(&mut rooms, handle, channel);
        }
        if !channels.is_empty() {
            info!(count = channels.len(), "Connection removed from all channels");
        }
        channels
    }

    pub fn members(&self, channel: &Channel) -> Vec<ConnId> {
        lock(&self.rooms)
            .members
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, handle: ConnId, channel: &Channel) -> bool {
        lock(&self.rooms)
            .members
            .get(channel)
            .is_some_and(|set| set.contains(&handle))
    }

    pub fn channels_of(&self, handle: ConnId) -> Vec<Channel> {
        lock(&self.rooms)
            .joined
            .get(&handle)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.rooms).members.len()
    }

    fn remove_member(rooms: &mut Rooms, handle: ConnId, channel: &Channel) -> bool {
        let Some(members) = rooms.members.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&handle);
        if members.is_empty() {
            rooms.members.remove(channel);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn connection(mux: &RoomMultiplexer) -> (ConnId, UnboundedReceiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnId::new();
        mux.attach(handle, tx);
        (handle, rx)
    }

    fn received(rx: &mut UnboundedReceiver<Arc<ServerEvent>>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::Conversation(42).to_string(), "conversation:42");
        assert_eq!(Channel::Inbox("alice".into()).to_string(), "inbox:alice");
    }

    #[test]
    fn broadcast_reaches_members_except_excluded() {
        let mux = RoomMultiplexer::new();
        let (a, mut rx_a) = connection(&mux);
        let (b, mut rx_b) = connection(&mux);
        let (_c, mut rx_c) = connection(&mux);
        let room = Channel::Conversation(1);

        assert!(mux.join(a, room.clone()));
        assert!(!mux.join(a, room.clone()));
        mux.join(b, room.clone());
        assert!(mux.is_member(a, &room));
        assert!(!mux.is_member(a, &Channel::Conversation(2)));

        assert_eq!(mux.broadcast(&room, ServerEvent::ConversationUpdated, Some(a)), 1);
        assert_eq!(received(&mut rx_a), 0);
        assert_eq!(received(&mut rx_b), 1);
        // non iscritto
        assert_eq!(received(&mut rx_c), 0);
    }

    #[test]
    fn leave_drops_empty_channels() {
        let mux = RoomMultiplexer::new();
        let (a, _rx) = connection(&mux);
        let room = Channel::Inbox("alice".into());

        mux.join(a, room.clone());
        assert_eq!(mux.channel_count(), 1);
        assert!(mux.leave(a, &room));
        assert!(!mux.leave(a, &room));
        assert_eq!(mux.channel_count(), 0);
        assert!(mux.channels_of(a).is_empty());
    }

    #[test]
    fn leave_all_is_idempotent() {
        let mux = RoomMultiplexer::new();
        let (a, _rx_a) = connection(&mux);
        let (b, mut rx_b) = connection(&mux);
        mux.join(a, Channel::Conversation(1));
        mux.join(a, Channel::Inbox("alice".into()));
        mux.join(b, Channel::Conversation(1));

        let mut left = mux.leave_all(a);
        left.sort_by_key(|c| c.to_string());
        assert_eq!(
            left,
            vec![Channel::Conversation(1), Channel::Inbox("alice".into())]
        );
        assert!(mux.leave_all(a).is_empty());
        assert_eq!(mux.members(&Channel::Conversation(1)), vec![b]);

        mux.broadcast(&Channel::Conversation(1), ServerEvent::ConversationUpdated, None);
        assert_eq!(received(&mut rx_b), 1);
        assert!(!mux.send_to(a, ServerEvent::ConversationUpdated));
    }

    #[test]
    fn closed_sink_does_not_break_broadcast() {
        let mux = RoomMultiplexer::new();
        let (a, rx_a) = connection(&mux);
        let (b, mut rx_b) = connection(&mux);
        let room = Channel::Conversation(9);
        mux.join(a, room.clone());
        mux.join(b, room.clone());

        drop(rx_a);
        assert_eq!(mux.broadcast(&room, ServerEvent::ConversationUpdated, None), 1);
        assert_eq!(received(&mut rx_b), 1);
    }
}
