//! Integration tests per il protocollo WebSocket
//!
//! Due livelli:
//! - handler degli eventi pilotati direttamente, con la coda della connessione
//!   letta dal test al posto del writer
//! - sessioni reali con tokio-tungstenite contro il router servito su una porta effimera

mod common;

#[cfg(test)]
mod ws_tests {
    use super::common::*;
    use axum_test::http::{HeaderName, StatusCode};
    use chatsync::dtos::{ClientEvent, CreateConversationDTO, CreateMessageDTO, ServerEvent, TypingDTO};
    use chatsync::entities::{ConversationKind, Message};
    use chatsync::repositories::MessageStore;
    use chatsync::sync::{ConnId, PresenceChange};
    use chatsync::ws::event_handlers::process_event;
    use chatsync::AppState;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
    use tokio::time::{Duration, timeout};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn private_chat(state: &AppState, a: &str, b: &str) -> i64 {
        state
            .store
            .create_conversation(&CreateConversationDTO {
                kind: ConversationKind::Private,
                name: None,
                participants: vec![a.to_string(), b.to_string()],
            })
            .await
            .expect("conversation created")
            .conversation_id
    }

    async fn persisted(state: &AppState, conversation_id: i64, sender: &str, text: &str) -> Message {
        state
            .store
            .insert_message(&CreateMessageDTO {
                conversation_id,
                sender_id: sender.to_string(),
                content: Some(text.to_string()),
                attachments: vec![],
            })
            .await
            .expect("message inserted")
    }

    fn connect(state: &AppState, identity: &str) -> (ConnId, UnboundedReceiver<Arc<ServerEvent>>) {
        let (tx, rx) = unbounded_channel();
        let handle = state.sync.open(Some(identity.to_string()), tx);
        (handle, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Arc<ServerEvent>>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    // ============================================================
    // Handler degli eventi
    // ============================================================

    #[tokio::test]
    async fn test_join_chat_requires_participation() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (mallory, mut rx) = connect(&state, "mallory");

        process_event(&state, mallory, ClientEvent::JoinChat(chat)).await;

        match drain(&mut rx).as_slice() {
            [ServerEvent::Error { code, .. }] => assert_eq!(*code, 403),
            other => panic!("expected a single error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_event_is_rejected_before_dispatch() {
        let state = create_test_state();
        let (alice, mut rx) = connect(&state, "alice");

        process_event(&state, alice, ClientEvent::JoinChat(0)).await;
        process_event(
            &state,
            alice,
            ClientEvent::Typing(TypingDTO {
                conversation_id: 1,
                identity: String::new(),
            }),
        )
        .await;

        let codes: Vec<u16> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![400, 400]);
    }

    #[tokio::test]
    async fn test_send_message_reaches_other_members_only() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (alice, mut alice_rx) = connect(&state, "alice");
        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, alice, ClientEvent::JoinChat(chat)).await;
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;

        let message = persisted(&state, chat, "alice", "ciao bob").await;
        process_event(&state, alice, ClientEvent::SendMessage(message.clone())).await;

        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::NewMessage(message)]);
        assert!(drain(&mut alice_rx).is_empty(), "sender must not get an echo");
    }

    #[tokio::test]
    async fn test_send_message_with_forged_sender_is_rejected() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (alice, _alice_rx) = connect(&state, "alice");
        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, alice, ClientEvent::JoinChat(chat)).await;
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;

        // bob prova a far passare un messaggio come se fosse di alice
        let message = persisted(&state, chat, "alice", "not mine").await;
        process_event(&state, bob, ClientEvent::SendMessage(message)).await;

        match drain(&mut bob_rx).as_slice() {
            [ServerEvent::Error { code, .. }] => assert_eq!(*code, 403),
            other => panic!("expected a rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpersisted_message_is_not_relayed() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (alice, mut alice_rx) = connect(&state, "alice");
        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, alice, ClientEvent::JoinChat(chat)).await;
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;

        let mut invented = persisted(&state, chat, "alice", "vero").await;
        invented.message_id = 424242;
        invented.content = Some("never stored".to_string());
        process_event(&state, alice, ClientEvent::SendMessage(invented)).await;

        assert!(drain(&mut bob_rx).is_empty());
        match drain(&mut alice_rx).as_slice() {
            [ServerEvent::Error { code, .. }] => assert_eq!(*code, 404),
            other => panic!("expected a single error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relayed_message_is_the_stored_copy() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (alice, _alice_rx) = connect(&state, "alice");
        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, alice, ClientEvent::JoinChat(chat)).await;
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;

        let stored = persisted(&state, chat, "alice", "originale").await;
        let mut edited = stored.clone();
        edited.content = Some("riscritto dal client".to_string());
        process_event(&state, alice, ClientEvent::SendMessage(edited)).await;

        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::NewMessage(stored)]);
    }

    #[tokio::test]
    async fn test_typing_outside_joined_conversation_is_rejected() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (mallory, mut mallory_rx) = connect(&state, "mallory");
        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;

        // join rifiutato: mallory non partecipa
        process_event(&state, mallory, ClientEvent::JoinChat(chat)).await;
        let typing = TypingDTO {
            conversation_id: chat,
            identity: "mallory".to_string(),
        };
        process_event(&state, mallory, ClientEvent::Typing(typing.clone())).await;
        process_event(&state, mallory, ClientEvent::StopTyping(typing)).await;

        assert!(drain(&mut bob_rx).is_empty());
        assert!(state.sync.active_typists(chat).is_empty());
        let codes: Vec<u16> = drain(&mut mallory_rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![403, 403, 403]);
    }

    #[tokio::test]
    async fn test_typing_is_announced_to_the_rest_of_the_channel() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let (alice, mut alice_rx) = connect(&state, "alice");
        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, alice, ClientEvent::JoinChat(chat)).await;
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;

        let typing = TypingDTO {
            conversation_id: chat,
            identity: "alice".to_string(),
        };
        process_event(&state, alice, ClientEvent::Typing(typing.clone())).await;
        // un refresh non viene ri-annunciato
        process_event(&state, alice, ClientEvent::Typing(typing.clone())).await;
        process_event(&state, alice, ClientEvent::StopTyping(typing.clone())).await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![
                ServerEvent::UserTyping(typing.clone()),
                ServerEvent::UserStopTyping(typing),
            ]
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_presence_snapshot_answers_only_the_requester() {
        let state = create_test_state();
        let (alice, mut alice_rx) = connect(&state, "alice");
        let (bob, mut bob_rx) = connect(&state, "bob");

        process_event(&state, alice, ClientEvent::JoinUserRoom("alice".into())).await;
        process_event(
            &state,
            bob,
            ClientEvent::RequestPresence(vec!["alice".into(), "carol".into()]),
        )
        .await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::PresenceSnapshot(vec![
                PresenceChange { identity: "alice".into(), online: true },
                PresenceChange { identity: "carol".into(), online: false },
            ])]
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_announcing_someone_else_is_rejected() {
        let state = create_test_state();
        let (bob, mut bob_rx) = connect(&state, "bob");

        process_event(&state, bob, ClientEvent::JoinUserRoom("alice".into())).await;

        assert!(!state.sync.is_online("alice"));
        match drain(&mut bob_rx).as_slice() {
            [ServerEvent::Error { code, .. }] => assert_eq!(*code, 401),
            other => panic!("expected an error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_send_fans_out_to_channel_and_inbox() {
        let state = create_test_state();
        let server = create_test_server(state.clone());
        let chat = private_chat(&state, "alice", "bob").await;

        let (bob, mut bob_rx) = connect(&state, "bob");
        process_event(&state, bob, ClientEvent::JoinChat(chat)).await;
        process_event(&state, bob, ClientEvent::JoinUserRoom("bob".into())).await;

        let response = server
            .post(&format!("/chats/{}/messages", chat))
            .add_header(HeaderName::from_static("authorization"), bearer("alice"))
            .json(&json!({ "content": "dal REST" }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let sent: Message = response.json();

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::NewMessage(sent), ServerEvent::ConversationUpdated]
        );
    }

    #[tokio::test]
    async fn test_rename_and_delete_notify_inboxes() {
        let state = create_test_state();
        let server = create_test_server(state.clone());
        let chat = state
            .store
            .create_conversation(&CreateConversationDTO {
                kind: ConversationKind::Group,
                name: Some("Weekend".to_string()),
                participants: vec!["alice".into(), "bob".into(), "carol".into()],
            })
            .await
            .expect("conversation created")
            .conversation_id;

        let (bob, mut bob_rx) = connect(&state, "bob");
        let (carol, mut carol_rx) = connect(&state, "carol");
        process_event(&state, bob, ClientEvent::JoinUserRoom("bob".into())).await;
        process_event(&state, carol, ClientEvent::JoinUserRoom("carol".into())).await;

        server
            .patch(&format!("/chats/{}", chat))
            .add_header(HeaderName::from_static("authorization"), bearer("alice"))
            .json(&json!({ "name": "Gita" }))
            .await
            .assert_status_ok();
        server
            .delete(&format!("/chats/{}", chat))
            .add_header(HeaderName::from_static("authorization"), bearer("alice"))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let expected = vec![ServerEvent::ConversationUpdated, ServerEvent::ConversationUpdated];
        assert_eq!(drain(&mut bob_rx), expected);
        assert_eq!(drain(&mut carol_rx), expected);
    }

    #[tokio::test]
    async fn test_typing_route_reflects_live_typists() {
        let state = create_test_state();
        let server = create_test_server(state.clone());
        let chat = private_chat(&state, "alice", "bob").await;
        let (alice, _alice_rx) = connect(&state, "alice");
        process_event(&state, alice, ClientEvent::JoinChat(chat)).await;
        process_event(
            &state,
            alice,
            ClientEvent::Typing(TypingDTO {
                conversation_id: chat,
                identity: "alice".into(),
            }),
        )
        .await;

        let typing: Vec<String> = server
            .get(&format!("/chats/{}/typing", chat))
            .add_header(HeaderName::from_static("authorization"), bearer("bob"))
            .await
            .json();
        assert_eq!(typing, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_closing_one_tab_keeps_identity_online() {
        let state = create_test_state();
        let mut feed = state.sync.subscribe_presence();
        let (first_tab, _rx1) = connect(&state, "alice");
        let (second_tab, _rx2) = connect(&state, "alice");

        process_event(&state, first_tab, ClientEvent::JoinUserRoom("alice".into())).await;
        process_event(&state, second_tab, ClientEvent::JoinUserRoom("alice".into())).await;

        assert!(state.sync.disconnect(first_tab));
        assert!(state.sync.is_online("alice"));
        assert!(state.sync.disconnect(second_tab));
        assert!(!state.sync.disconnect(second_tab));
        assert!(!state.sync.is_online("alice"));

        let mut transitions = Vec::new();
        while let Ok(change) = feed.try_recv() {
            transitions.push(change.online);
        }
        assert_eq!(transitions, vec![true, false]);
    }

    // ============================================================
    // Sessioni reali
    // ============================================================

    async fn open_client(addr: SocketAddr, identity: &str) -> Client {
        let mut request = format!("ws://{}/ws", addr)
            .into_client_request()
            .expect("valid websocket url");
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&bearer(identity)).expect("valid header"),
        );
        let (client, _) = connect_async(request).await.expect("websocket handshake");
        client
    }

    async fn emit(client: &mut Client, event: &ClientEvent) {
        let json = serde_json::to_string(event).expect("event serializes");
        client
            .send(WsMessage::Text(json.into()))
            .await
            .expect("frame sent");
    }

    /// Legge frame finché uno soddisfa `wanted`, ignorando il resto del feed
    async fn expect_event<F>(client: &mut Client, wanted: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                match client.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let event: ServerEvent =
                            serde_json::from_str(&text).expect("server sends valid events");
                        if wanted(&event) {
                            return event;
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended while waiting: {:?}", other),
                }
            }
        })
        .await
        .expect("event arrived in time")
    }

    /// Barriera: quando arriva lo snapshot, tutti gli eventi precedenti della
    /// stessa connessione sono stati processati
    async fn sync_point(client: &mut Client, identity: &str) -> Vec<PresenceChange> {
        emit(client, &ClientEvent::RequestPresence(vec![identity.to_string()])).await;
        match expect_event(client, |e| matches!(e, ServerEvent::PresenceSnapshot(_))).await {
            ServerEvent::PresenceSnapshot(snapshot) => snapshot,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_ws_requires_token() {
        let addr = spawn_test_app(create_test_state()).await;
        let result = connect_async(format!("ws://{}/ws", addr)).await;
        assert!(result.is_err(), "handshake without a token must fail");
    }

    #[tokio::test]
    async fn test_ws_malformed_frame_gets_error_event() {
        let addr = spawn_test_app(create_test_state()).await;
        let mut alice = open_client(addr, "alice").await;

        alice
            .send(WsMessage::Text("{ not json".to_string().into()))
            .await
            .expect("frame sent");

        let event = expect_event(&mut alice, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert_eq!(
            event,
            ServerEvent::Error {
                code: 400,
                message: "Malformed event".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_ws_session_end_to_end() {
        let state = create_test_state();
        let chat = private_chat(&state, "alice", "bob").await;
        let addr = spawn_test_app(state.clone()).await;

        let mut alice = open_client(addr, "alice").await;
        let mut bob = open_client(addr, "bob").await;

        emit(&mut alice, &ClientEvent::JoinUserRoom("alice".into())).await;
        emit(&mut alice, &ClientEvent::JoinChat(chat)).await;
        let snapshot = sync_point(&mut alice, "alice").await;
        assert_eq!(snapshot, vec![PresenceChange { identity: "alice".into(), online: true }]);

        emit(&mut bob, &ClientEvent::JoinUserRoom("bob".into())).await;
        emit(&mut bob, &ClientEvent::JoinChat(chat)).await;
        sync_point(&mut bob, "bob").await;

        // messaggio reso durevole dal client, poi inoltrato sul canale
        let message = persisted(&state, chat, "alice", "ci sei?").await;
        emit(&mut alice, &ClientEvent::SendMessage(message.clone())).await;
        let received = expect_event(&mut bob, |e| matches!(e, ServerEvent::NewMessage(_))).await;
        assert_eq!(received, ServerEvent::NewMessage(message));

        let typing = TypingDTO {
            conversation_id: chat,
            identity: "alice".into(),
        };
        emit(&mut alice, &ClientEvent::Typing(typing.clone())).await;
        let received = expect_event(&mut bob, |e| matches!(e, ServerEvent::UserTyping(_))).await;
        assert_eq!(received, ServerEvent::UserTyping(typing.clone()));

        // chiudere il socket senza stop_typing: il flag viene ritirato con la connessione.
        // stop_typing e presenza arrivano da due sorgenti diverse, l'ordine non è garantito
        alice.close(None).await.expect("close frame sent");
        let mut stopped = None;
        let mut offline = None;
        while stopped.is_none() || offline.is_none() {
            match expect_event(&mut bob, |e| {
                matches!(e, ServerEvent::UserStopTyping(_))
                    || matches!(e, ServerEvent::UserPresence(change) if !change.online)
            })
            .await
            {
                ServerEvent::UserStopTyping(dto) => stopped = Some(dto),
                ServerEvent::UserPresence(change) => offline = Some(change),
                _ => unreachable!(),
            }
        }
        assert_eq!(stopped, Some(typing));
        assert_eq!(offline, Some(PresenceChange { identity: "alice".into(), online: false }));

        let snapshot = sync_point(&mut bob, "alice").await;
        assert_eq!(snapshot, vec![PresenceChange { identity: "alice".into(), online: false }]);
    }
}
