//! Typing Coordinator - Indicatori "sta scrivendo" con scadenza
//!
//! Un flag per coppia (conversazione, identità). Solo i fronti vengono
//! annunciati sul canale della conversazione: il refresh di un flag attivo
//! sposta la scadenza senza generare traffico. I flag mai fermati
//! esplicitamente (tab chiusa, client crashato) vengono chiusi dallo sweeper
//! con lo stesso evento `user_stop_typing`, una sola volta.

use super::lock;
use super::rooms::{Channel, ConnId, RoomMultiplexer};
use crate::core::SyncError;
use crate::dtos::{ServerEvent, TypingDTO, validate_identity};
use crate::entities::Identity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

struct TypingFlag {
    expires_at: Instant,
    /// Connessione che ha alzato il flag, esclusa dai broadcast
    origin: Option<ConnId>,
}

type FlagKey = (i64, Identity);

pub struct TypingCoordinator {
    flags: Mutex<HashMap<FlagKey, TypingFlag>>,
    timeout: Duration,
    rooms: Arc<RoomMultiplexer>,
}

impl TypingCoordinator {
    pub fn new(rooms: Arc<RoomMultiplexer>, timeout: Duration) -> Self {
        TypingCoordinator {
            flags: Mutex::new(HashMap::new()),
            timeout,
            rooms,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Alza o rinfresca il flag. Restituisce `true` se è stato annunciato un nuovo inizio.
    #[instrument(skip(self))]
    pub fn start_typing(
        &self,
        conversation_id: i64,
        identity: &str,
        origin: Option<ConnId>,
    ) -> Result<bool, SyncError> {
        validate_identity(identity)?;
        let now = Instant::now();
        let expires_at = now + self.timeout;

        let mut flags = lock(&self.flags);
        let key = (conversation_id, identity.to_string());

        if let Some(flag) = flags.get_mut(&key) {
            if flag.expires_at > now {
                flag.expires_at = expires_at;
                flag.origin = origin;
                debug!("Typing flag refreshed");
                return Ok(false);
            }
            // scaduto ma non ancora raccolto dallo sweeper: chiude il fronte precedente
            let stale_origin = flag.origin;
            self.announce(conversation_id, identity, false, stale_origin);
        }

        flags.insert(key, TypingFlag { expires_at, origin });
        self.announce(conversation_id, identity, true, origin);
        Ok(true)
    }

    /// Abbassa il flag. Restituisce `true` se esisteva (e quindi è stato annunciato lo stop).
    #[instrument(skip(self))]
    pub fn stop_typing(
        &self,
        conversation_id: i64,
        identity: &str,
        origin: Option<ConnId>,
    ) -> Result<bool, SyncError> {
        validate_identity(identity)?;
        let mut flags = lock(&self.flags);
        match flags.remove(&(conversation_id, identity.to_string())) {
            Some(flag) => {
                self.announce(conversation_id, identity, false, origin.or(flag.origin));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Chiude tutti i flag scaduti, ciascuno con un solo `user_stop_typing`.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut flags = lock(&self.flags);
        let expired: Vec<FlagKey> = flags
            .iter()
            .filter(|(_, flag)| flag.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(flag) = flags.remove(key) {
                self.announce(key.0, &key.1, false, flag.origin);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired typing flags swept");
        }
        expired.len()
    }

    /// Pulizia alla disconnessione: chiude i flag alzati da `handle` e, se
    /// l'identità è andata offline, anche quelli alzati da altre sue connessioni.
    #[instrument(skip(self))]
    pub fn clear_connection(&self, handle: ConnId, offline_identity: Option<&str>) -> usize {
        let mut flags = lock(&self.flags);
        let owned: Vec<FlagKey> = flags
            .iter()
            .filter(|((_, identity), flag)| {
                flag.origin == Some(handle) || offline_identity == Some(identity.as_str())
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &owned {
            if let Some(flag) = flags.remove(key) {
                self.announce(key.0, &key.1, false, flag.origin);
            }
        }
        owned.len()
    }

    /// Identità che stanno scrivendo in una conversazione, ordinate.
    /// I flag scaduti non ancora raccolti non vengono riportati.
    pub fn active_typists(&self, conversation_id: i64) -> Vec<Identity> {
        let now = Instant::now();
        let mut typists: Vec<Identity> = lock(&self.flags)
            .iter()
            .filter(|((conv, _), flag)| *conv == conversation_id && flag.expires_at > now)
            .map(|((_, identity), _)| identity.clone())
            .collect();
        typists.sort();
        typists
    }

    pub fn is_typing(&self, conversation_id: i64, identity: &str) -> bool {
        lock(&self.flags)
            .get(&(conversation_id, identity.to_string()))
            .is_some_and(|flag| flag.expires_at > Instant::now())
    }

    /// Avvia lo sweeper periodico. Il task termina da solo quando il coordinator viene rilasciato.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match coordinator.upgrade() {
                    Some(coordinator) => {
                        coordinator.sweep();
                    }
                    None => {
                        debug!("Typing coordinator dropped, sweeper exiting");
                        break;
                    }
                }
            }
        })
    }

    fn announce(&self, conversation_id: i64, identity: &str, typing: bool, exclude: Option<ConnId>) {
        let payload = TypingDTO {
            conversation_id,
            identity: identity.to_string(),
        };
        let event = if typing {
            ServerEvent::UserTyping(payload)
        } else {
            ServerEvent::UserStopTyping(payload)
        };
        self.rooms
            .broadcast(&Channel::Conversation(conversation_id), event, exclude);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const TIMEOUT: Duration = Duration::from_millis(2000);

    struct Fixture {
        typing: Arc<TypingCoordinator>,
        typer: ConnId,
        observer_rx: UnboundedReceiver<Arc<ServerEvent>>,
        typer_rx: UnboundedReceiver<Arc<ServerEvent>>,
    }

    fn fixture() -> Fixture {
        let rooms = Arc::new(RoomMultiplexer::new());
        let (typer, observer) = (ConnId::new(), ConnId::new());
        let (typer_tx, typer_rx) = mpsc::unbounded_channel();
        let (observer_tx, observer_rx) = mpsc::unbounded_channel();
        rooms.attach(typer, typer_tx);
        rooms.attach(observer, observer_tx);
        rooms.join(typer, Channel::Conversation(1));
        rooms.join(observer, Channel::Conversation(1));

        Fixture {
            typing: Arc::new(TypingCoordinator::new(rooms, TIMEOUT)),
            typer,
            observer_rx,
            typer_rx,
        }
    }

    /// (started, stopped) ricevuti finora
    fn tally(rx: &mut UnboundedReceiver<Arc<ServerEvent>>) -> (usize, usize) {
        let (mut started, mut stopped) = (0, 0);
        while let Ok(event) = rx.try_recv() {
            match event.as_ref() {
                ServerEvent::UserTyping(_) => started += 1,
                ServerEvent::UserStopTyping(_) => stopped += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        (started, stopped)
    }

    #[tokio::test(start_paused = true)]
    async fn start_start_stop_announces_each_edge_once() {
        let mut f = fixture();

        assert_eq!(f.typing.start_typing(1, "alice", Some(f.typer)), Ok(true));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(f.typing.start_typing(1, "alice", Some(f.typer)), Ok(false));
        assert_eq!(f.typing.stop_typing(1, "alice", Some(f.typer)), Ok(true));
        assert_eq!(f.typing.stop_typing(1, "alice", Some(f.typer)), Ok(false));

        assert_eq!(tally(&mut f.observer_rx), (1, 1));
        // il typer non riceve l'eco dei propri segnali
        assert_eq!(tally(&mut f.typer_rx), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_flag_expires_once_through_sweeper() {
        let mut f = fixture();
        let sweeper = f.typing.spawn_sweeper(Duration::from_millis(250));

        f.typing.start_typing(1, "alice", Some(f.typer)).expect("valid identity");
        assert_eq!(f.typing.active_typists(1), vec!["alice".to_string()]);

        tokio::time::sleep(TIMEOUT + Duration::from_millis(500)).await;
        assert_eq!(tally(&mut f.observer_rx), (1, 1));
        assert!(f.typing.active_typists(1).is_empty());

        // nessun ulteriore stop senza nuovo input
        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(tally(&mut f.observer_rx), (0, 0));
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_expiry() {
        let mut f = fixture();
        f.typing.start_typing(1, "alice", None).expect("valid identity");

        tokio::time::advance(Duration::from_millis(1500)).await;
        f.typing.start_typing(1, "alice", None).expect("valid identity");
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(f.typing.sweep(), 0);
        assert!(f.typing.is_typing(1, "alice"));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(f.typing.sweep(), 1);
        assert_eq!(tally(&mut f.observer_rx), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_unswept_flag_closes_before_restart() {
        let mut f = fixture();
        f.typing.start_typing(1, "alice", None).expect("valid identity");
        tokio::time::advance(TIMEOUT + Duration::from_millis(1)).await;

        assert_eq!(f.typing.start_typing(1, "alice", None), Ok(true));
        assert_eq!(tally(&mut f.observer_rx), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn active_typists_lists_everyone() {
        let f = fixture();
        f.typing.start_typing(1, "carol", None).expect("valid identity");
        f.typing.start_typing(1, "alice", None).expect("valid identity");
        f.typing.start_typing(2, "bob", None).expect("valid identity");

        assert_eq!(
            f.typing.active_typists(1),
            vec!["alice".to_string(), "carol".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_connection_stops_owned_flags() {
        let mut f = fixture();
        let other_tab = ConnId::new();
        f.typing.start_typing(1, "alice", Some(f.typer)).expect("valid identity");
        f.typing.start_typing(2, "alice", Some(other_tab)).expect("valid identity");

        // alice resta online con l'altra scheda: solo il flag di `typer` si chiude
        assert_eq!(f.typing.clear_connection(f.typer, None), 1);
        assert!(f.typing.is_typing(2, "alice"));
        assert_eq!(tally(&mut f.observer_rx), (1, 1));

        // identità offline: chiude anche i flag delle altre connessioni
        assert_eq!(f.typing.clear_connection(other_tab, Some("alice")), 1);
        assert!(!f.typing.is_typing(2, "alice"));
    }

    #[test]
    fn empty_identity_is_rejected() {
        let rooms = Arc::new(RoomMultiplexer::new());
        let typing = TypingCoordinator::new(rooms, TIMEOUT);
        assert!(matches!(
            typing.start_typing(1, "", None),
            Err(SyncError::InvalidArgument(_))
        ));
    }
}
