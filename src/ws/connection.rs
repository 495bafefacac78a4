//! WebSocket Connection Management - Gestione connessioni WebSocket
//!
//! Ogni socket ha due task:
//! - listen_ws: legge i frame, li deserializza in `ClientEvent` e li passa agli handler
//! - write_ws: unisce la coda in uscita della connessione e il feed di presenza
//!
//! La fine di uno dei due porta a una sola `disconnect` sulla façade.

use crate::AppState;
use crate::dtos::{ClientEvent, ServerEvent};
use crate::sync::{ConnId, PresenceChange};
use crate::ws::event_handlers::process_event;
use crate::ws::{RATE_LIMITER_MILLIS, TIMEOUT_DURATION_SECONDS};
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::{Duration, interval, timeout};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error, info, instrument, warn};

#[instrument(skip(ws, state))]
pub async fn handle_socket(ws: WebSocket, state: Arc<AppState>, identity: String) {
    info!("WebSocket connection established");

    // Dividiamo il WebSocket in due metà: sender e receiver
    let (ws_tx, ws_rx) = ws.split();

    // Coda in uscita della connessione: l'unico sender vive nel Room Multiplexer,
    // quindi quando la connessione lascia tutte le stanze il writer si ferma
    let (sink_tx, sink_rx) = unbounded_channel::<Arc<ServerEvent>>();

    // feed di presenza posseduto dal writer, rilasciato con lui
    let presence = BroadcastStream::new(state.sync.subscribe_presence());
    let handle = state.sync.open(Some(identity), sink_tx);

    tokio::spawn(listen_ws(handle, ws_rx, state.clone()));
    tokio::spawn(write_ws(handle, ws_tx, sink_rx, presence, state));
}

#[instrument(skip(websocket_tx, outbound, presence, state))]
pub async fn write_ws(
    handle: ConnId,
    mut websocket_tx: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<Arc<ServerEvent>>,
    mut presence: BroadcastStream<PresenceChange>,
    state: Arc<AppState>,
) {
    info!("Write task started");

    loop {
        tokio::select! {
            event = outbound.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut websocket_tx, &event).await.is_err() {
                            warn!("Failed to send event, closing connection");
                            break;
                        }
                    }
                    None => {
                        info!("Outbound queue closed");
                        break; // connessione rimossa dalla façade, il listener ha chiuso
                    }
                }
            }

            change = StreamExt::next(&mut presence) => {
                match change {
                    Some(Ok(change)) => {
                        let event = ServerEvent::UserPresence(change);
                        if send_event(&mut websocket_tx, &event).await.is_err() {
                            warn!("Failed to send presence change, closing connection");
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        // il client riconcilia con request_presence
                        warn!(skipped, "Presence feed lagged");
                    }
                    None => {
                        info!("Presence feed closed");
                        break;
                    }
                }
            }
        }
    }

    let _ = websocket_tx.close().await;
    // idempotente: se il listener ha già chiuso la connessione non succede nulla
    state.sync.disconnect(handle);
    info!("Write task terminated");
}

#[instrument(skip(websocket_tx, event))]
async fn send_event(
    websocket_tx: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(|e| {
        error!("Failed to serialize event: {:?}", e);
        axum::Error::new(e)
    })?;
    websocket_tx
        .send(Message::Text(Utf8Bytes::from(json)))
        .await
        .map_err(|e| {
            error!("Failed to send event through WebSocket: {:?}", e);
            e
        })
}

#[instrument(skip(websocket_rx, state))]
pub async fn listen_ws(handle: ConnId, mut websocket_rx: SplitStream<WebSocket>, state: Arc<AppState>) {
    info!("Listen task started");

    let mut rate_limiter = interval(Duration::from_millis(RATE_LIMITER_MILLIS));
    let timeout_duration = Duration::from_secs(TIMEOUT_DURATION_SECONDS);

    loop {
        match timeout(timeout_duration, StreamExt::next(&mut websocket_rx)).await {
            Ok(Some(msg_result)) => {
                rate_limiter.tick().await;

                let msg = match msg_result {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("WebSocket error: {:?}", e);
                        break;
                    }
                };

                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => {
                            debug!(event = event.name(), "Event received from client");
                            process_event(&state, handle, event).await;
                        }
                        Err(e) => {
                            warn!("Failed to deserialize event: {}", e);
                            state.sync.send_to(
                                handle,
                                ServerEvent::Error {
                                    code: 400,
                                    message: "Malformed event".to_string(),
                                },
                            );
                        }
                    },
                    Message::Close(_) => {
                        info!("Close message received");
                        break;
                    }
                    _ => {}
                }
            }
            Ok(None) => {
                info!("WebSocket stream ended");
                break;
            }
            Err(_) => {
                warn!(
                    timeout_secs = TIMEOUT_DURATION_SECONDS,
                    "Connection timeout"
                );
                break;
            }
        }
    }

    // Cleanup: stanze, presenza e typing. Chiude anche la coda del writer.
    info!("Cleaning up connection");
    state.sync.disconnect(handle);
    info!("Listen task terminated");
}
