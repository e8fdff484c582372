// =============================================================================
// WebSocket Handler — subscription hub endpoint
// =============================================================================
//
// Clients connect to `/ws`, receive a `welcome` frame carrying their
// connection id, then drive their subscriptions with SUBSCRIBE / UNSUBSCRIBE /
// PING requests. Every connection gets:
//
//   - a writer task draining the hub's bounded outbound queue onto the socket
//     (broadcasts, replies, liveness pings, eviction close);
//   - the read loop below, answering each text frame through the hub.
//
// Eviction fires the connection's termination signal, which ends both even
// when the outbound queue is full.
// A malformed frame is answered with an `error` envelope; the socket stays up.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::hub::protocol::{Reply, ServerFrame};
use crate::hub::Outbound;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single downstream connection from registration to removal.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let hub = state.hub.clone();
    let (tx, mut rx) = hub.outbound_channel();
    let registration = hub.register(tx.clone());
    let id = registration.id;
    let evicted = registration.terminated.notified();
    tokio::pin!(evicted);
    let (mut sender, mut receiver) = socket.split();

    // Welcome goes out before the connection can receive broadcasts.
    let welcome = match Reply::Frame(ServerFrame::welcome(id)).to_text() {
        Ok(text) => text,
        Err(e) => {
            warn!(connection = %id, error = %e, "failed to encode welcome");
            hub.remove(id);
            return;
        }
    };
    if let Err(e) = sender.send(Message::Text(welcome)).await {
        debug!(connection = %id, error = %e, "welcome send failed");
        hub.remove(id);
        return;
    }
    if let Err(e) = hub.activate(id) {
        warn!(connection = %id, error = %e, "activation failed");
        return;
    }
    info!(connection = %id, "downstream connection open");

    let mut writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                Outbound::Text(text) => sender.send(Message::Text(text)).await,
                Outbound::Ping => sender.send(Message::Ping(Vec::new())).await,
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
            };
            if let Err(e) = result {
                debug!(error = %e, "downstream write failed");
                return;
            }
        }
    });

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = hub.handle_frame(id, &text);
                        match reply.to_text() {
                            Ok(out) => {
                                let sent = tokio::select! {
                                    r = tx.send(Outbound::Text(out)) => r.is_ok(),
                                    _ = &mut evicted => false,
                                };
                                if !sent {
                                    break;
                                }
                            }
                            Err(e) => warn!(connection = %id, error = %e, "failed to encode reply"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => hub.record_pong(id),
                    // tungstenite queues the pong reply itself.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = %id, "binary frame ignored");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %id, "client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection = %id, error = %e, "downstream read failed");
                        break;
                    }
                }
            }
            _ = &mut evicted => {
                debug!(connection = %id, "evicted, dropping socket");
                break;
            }
            // Writer gone: close frame written or a dead socket.
            _ = &mut writer => break,
        }
    }

    let _ = hub.begin_close(id);
    let channels = hub.remove(id);
    writer.abort();
    info!(
        connection = %id,
        channels = channels.len(),
        "downstream connection closed"
    );
}
