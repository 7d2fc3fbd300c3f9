//! Test utilities and common setup.
#![allow(dead_code)]

use axum::Router;
use intercom::config::PairingConfig;
use intercom::relay::Connection;
use intercom::{AppState, Relay, RelayConfig, routes};
use intercom_protocol::ServerEvent;
use serde_json::json;
use tokio::sync::mpsc;

/// Default configuration with `usuario-a` paired to `usuario-b`.
pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.server.connection_buffer = 32;
    config.pairings.push(PairingConfig {
        primary: "usuario-a".to_string(),
        companion: "usuario-b".to_string(),
    });
    config
}

pub async fn test_state() -> AppState {
    let config = test_config();
    let relay = Relay::new(&config).await.expect("relay builds from test config");
    AppState::new(relay, config)
}

pub async fn test_app() -> (Router, AppState) {
    let state = test_state().await;
    (routes::router(state.clone()), state)
}

/// A connected and registered test participant.
pub struct Peer {
    pub connection: Connection,
    pub rx: mpsc::Receiver<ServerEvent>,
}

impl Peer {
    pub fn join(relay: &Relay, id: &str, role: &str) -> Self {
        let (connection, mut rx) = relay.connect();
        let frame = json!({"type": "register", "participant_id": id, "role": role});
        relay
            .handle_frame(&connection, &frame.to_string())
            .expect("registration accepted");
        match rx.try_recv() {
            Ok(ServerEvent::Registered { .. }) => {}
            other => panic!("expected registration ack, got {other:?}"),
        }
        Self { connection, rx }
    }

    pub fn send(&self, relay: &Relay, to: serde_json::Value, body: &str) {
        let frame = json!({"type": "send", "to": to, "body": body});
        relay
            .handle_frame(&self.connection, &frame.to_string())
            .expect("frame accepted");
    }

    /// Next chat message queued for this peer, as `(from, body, escalated)`.
    pub fn next_message(&mut self) -> Option<(String, String, bool)> {
        loop {
            match self.rx.try_recv().ok()? {
                ServerEvent::Message {
                    from,
                    body,
                    escalation,
                    ..
                } => return Some((from, body, escalation.is_some())),
                _ => continue,
            }
        }
    }

    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
