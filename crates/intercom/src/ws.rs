//! WebSocket transport adapter.

use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use intercom_protocol::ServerEvent;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::relay::{Connection, FrameOutcome, Relay};

type WsSender = SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let ping_every = state.config.server.ping_interval();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, ping_every))
}

async fn send_event(sender: &mut WsSender, event: &ServerEvent) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, ping_every: Duration) {
    let relay = state.relay.clone();
    let (mut sender, mut receiver) = socket.split();

    let (connection, mut event_rx) = relay.connect();
    let conn_id = connection.id();

    let connected = ServerEvent::Connected {
        connection_id: conn_id.as_uuid(),
    };
    if let Err(e) = send_event(&mut sender, &connected).await {
        warn!(connection = %conn_id, "Failed to send connected message: {}", e);
        relay.disconnect(conn_id);
        return;
    }

    // Forward queued events and keepalive pings to the client.
    let send_task = tokio::spawn(async move {
        let first_ping = tokio::time::Instant::now() + ping_every;
        let mut ping_interval = tokio::time::interval_at(first_ping, ping_every);

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if send_event(&mut sender, &ServerEvent::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => handle_text(&relay, &connection, text.as_str()),
            Ok(Message::Binary(_)) => {
                debug!(connection = %conn_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(connection = %conn_id, "Client closed WebSocket connection");
                break;
            }
            Err(e) => {
                warn!(connection = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    let participant = relay.disconnect(conn_id);
    info!(
        connection = %conn_id,
        participant = ?participant.as_ref().map(|p| p.as_str()),
        "WebSocket connection closed"
    );
}

fn handle_text(relay: &Relay, connection: &Connection, text: &str) {
    match relay.handle_frame(connection, text) {
        Ok(FrameOutcome::Routed(outcome)) => {
            debug!(
                connection = %connection.id(),
                message_id = %outcome.message.id(),
                deliveries = outcome.deliveries.len(),
                issues = outcome.issues.len(),
                "Frame routed"
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(connection = %connection.id(), "Rejected frame: {}", e);
            let event = ServerEvent::Error {
                code: e.code(),
                message: e.to_string(),
            };
            if let Err(e) = connection.notify(event) {
                debug!(connection = %connection.id(), "Failed to report error: {}", e);
            }
        }
    }
}
