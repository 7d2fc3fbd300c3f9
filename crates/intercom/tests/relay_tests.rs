//! End-to-end scenarios through the relay facade.

use intercom::Relay;
use intercom::relay::FrameOutcome;
use intercom::escalation::{ChannelState, EscalationKey};
use intercom::message::ParticipantId;
use intercom::registry::Pairing;
use intercom_protocol::{CloseReason, ServerEvent};
use serde_json::{Value, json};
use tempfile::TempDir;

mod common;
use common::{Peer, test_config};

async fn relay() -> Relay {
    Relay::new(&test_config()).await.unwrap()
}

fn pairing_key() -> EscalationKey {
    EscalationKey::Pairing(Pairing::new("usuario-a", "usuario-b"))
}

fn role(r: &str) -> Value {
    json!({ "role": r })
}

#[tokio::test]
async fn test_distress_message_reaches_companion_and_operator() {
    let relay = relay().await;
    let mut a = Peer::join(&relay, "usuario-a", "primary");
    let mut b = Peer::join(&relay, "usuario-b", "companion");
    let mut c = Peer::join(&relay, "agente-c", "operator");

    a.send(&relay, role("companion"), "necesito ayuda");

    assert_eq!(
        b.next_message(),
        Some(("usuario-a".to_string(), "necesito ayuda".to_string(), false))
    );
    assert_eq!(
        c.next_message(),
        Some(("usuario-a".to_string(), "necesito ayuda".to_string(), true))
    );
    assert!(a.next_message().is_none());

    let channel = relay.escalations().channel(&pairing_key()).unwrap();
    assert_eq!(channel.state, ChannelState::Open);
    assert_eq!(channel.operator, Some(ParticipantId::from("agente-c")));
}

#[tokio::test]
async fn test_everyday_message_stays_between_the_pair() {
    let relay = relay().await;
    let mut a = Peer::join(&relay, "usuario-a", "primary");
    let b = Peer::join(&relay, "usuario-b", "companion");
    let mut c = Peer::join(&relay, "agente-c", "operator");

    b.send(&relay, role("primary"), "buenos días");

    assert_eq!(
        a.next_message(),
        Some(("usuario-b".to_string(), "buenos días".to_string(), false))
    );
    assert!(c.next_message().is_none());
    assert!(relay.escalations().open_channels().is_empty());
}

#[tokio::test]
async fn test_alert_without_operator_is_surfaced() {
    let relay = relay().await;
    let a = Peer::join(&relay, "usuario-a", "primary");
    let mut b = Peer::join(&relay, "usuario-b", "companion");

    a.send(&relay, role("companion"), "SOS");

    assert!(b.next_message().is_some());
    let stats = relay.stats();
    assert_eq!(stats.no_operator_available, 1);
    assert_eq!(stats.messages_alerted, 1);
    assert_eq!(stats.escalations_opened, 1);
}

#[tokio::test]
async fn test_new_operator_is_resolved_at_alert_time() {
    let relay = relay().await;
    let a = Peer::join(&relay, "usuario-a", "primary");
    let first = Peer::join(&relay, "agente-1", "operator");

    a.send(&relay, role("companion"), "ayuda");
    relay.disconnect(first.connection.id());

    let mut second = Peer::join(&relay, "agente-2", "operator");
    a.send(&relay, role("companion"), "ayuda, sigo aquí");

    assert_eq!(
        second.next_message(),
        Some(("usuario-a".to_string(), "ayuda, sigo aquí".to_string(), true))
    );
    assert_eq!(relay.stats().no_operator_available, 0);
}

#[tokio::test]
async fn test_closed_channel_reopens_as_new_episode() {
    let relay = relay().await;
    let a = Peer::join(&relay, "usuario-a", "primary");
    let mut c = Peer::join(&relay, "agente-c", "operator");

    a.send(&relay, role("companion"), "sos");
    let first = relay.escalations().channel(&pairing_key()).unwrap();

    relay
        .handle_frame(
            &c.connection,
            r#"{"type":"close_escalation","participant_id":"usuario-a"}"#,
        )
        .unwrap();
    assert!(relay.escalations().channel(&pairing_key()).is_none());
    assert!(c.drain().iter().any(|e| matches!(
        e,
        ServerEvent::EscalationClosed {
            reason: CloseReason::Operator,
            ..
        }
    )));

    a.send(&relay, role("companion"), "sos de nuevo");
    let second = relay.escalations().channel(&pairing_key()).unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(second.state, ChannelState::Open);
    let history = relay.escalations().history(&pairing_key());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, ChannelState::Closed);
}

#[tokio::test]
async fn test_reconnect_supersedes_previous_connection() {
    let relay = relay().await;
    let a = Peer::join(&relay, "usuario-a", "primary");
    let mut old_b = Peer::join(&relay, "usuario-b", "companion");
    let mut new_b = Peer::join(&relay, "usuario-b", "companion");

    assert!(old_b.drain().iter().any(|e| matches!(e, ServerEvent::Superseded { .. })));

    a.send(&relay, role("companion"), "hola");

    assert!(new_b.next_message().is_some());
    assert!(old_b.next_message().is_none());

    // The superseded connection can no longer speak for usuario-b.
    let err = relay
        .handle_frame(
            &old_b.connection,
            r#"{"type":"send","to":{"role":"primary"},"body":"hola"}"#,
        )
        .unwrap_err();
    assert!(matches!(err, intercom::error::RelayError::NotRegistered));
}

#[tokio::test]
async fn test_operator_reply_goes_to_alerting_participant() {
    let relay = relay().await;
    let mut a = Peer::join(&relay, "usuario-a", "primary");
    let mut b = Peer::join(&relay, "usuario-b", "companion");
    let mut c = Peer::join(&relay, "agente-c", "operator");

    a.send(&relay, role("companion"), "ayuda");
    b.drain();
    c.drain();

    c.send(&relay, json!({"participant": "usuario-a"}), "Estamos en camino");

    assert_eq!(
        a.next_message(),
        Some(("agente-c".to_string(), "Estamos en camino".to_string(), true))
    );
    assert!(b.next_message().is_none());
}

#[tokio::test]
async fn test_audit_file_records_messages_and_alerts() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit").join("intercom.jsonl");
    let mut config = test_config();
    config.audit.path = Some(path.clone());
    let relay = Relay::new(&config).await.unwrap();

    let a = Peer::join(&relay, "usuario-a", "primary");
    a.send(&relay, role("companion"), "buenos días");
    a.send(&relay, role("companion"), "ayuda");
    relay.flush_audit().await;

    let lines: Vec<Value> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    let messages: Vec<&Value> = lines.iter().filter(|l| l["kind"] == "message").collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["alerted"], false);
    assert_eq!(messages[1]["alerted"], true);
    assert_eq!(messages[1]["sender"], "usuario-a");

    let events: Vec<&str> = lines
        .iter()
        .filter(|l| l["kind"] == "alert")
        .filter_map(|l| l["event"].as_str())
        .collect();
    assert_eq!(events, vec!["escalation_opened", "no_operator_available"]);
}

fn close_for(relay: &Relay, operator: &Peer, participant: &str) -> Vec<intercom::escalation::EscalationChannel> {
    let frame = json!({"type": "close_escalation", "participant_id": participant});
    match relay
        .handle_frame(&operator.connection, &frame.to_string())
        .unwrap()
    {
        FrameOutcome::EscalationClosed(closed) => closed,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_operator_closes_solo_channel_after_participant_pairs() {
    let relay = relay().await;
    let d = Peer::join(&relay, "usuario-d", "primary");
    let c = Peer::join(&relay, "agente-c", "operator");

    d.send(&relay, role("companion"), "sos");
    let solo = relay.escalations().open_channels();
    assert_eq!(solo.len(), 1);

    let (e, mut e_rx) = relay.connect();
    let frame = json!({
        "type": "register",
        "participant_id": "usuario-e",
        "role": "companion",
        "partner": "usuario-d",
    });
    relay.handle_frame(&e, &frame.to_string()).unwrap();
    assert!(matches!(e_rx.try_recv().unwrap(), ServerEvent::Registered { .. }));

    let closed = close_for(&relay, &c, "usuario-d");

    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].id, solo[0].id);
    assert!(relay.escalations().open_channels().is_empty());
}

#[tokio::test]
async fn test_operator_closes_channel_after_pairing_is_replaced() {
    let relay = relay().await;
    let a = Peer::join(&relay, "usuario-a", "primary");
    let c = Peer::join(&relay, "agente-c", "operator");

    a.send(&relay, role("companion"), "ayuda");
    let channel = relay.escalations().channel(&pairing_key()).unwrap();

    let (f, _f_rx) = relay.connect();
    let frame = json!({
        "type": "register",
        "participant_id": "usuario-f",
        "role": "companion",
        "partner": "usuario-a",
    });
    relay.handle_frame(&f, &frame.to_string()).unwrap();
    assert_eq!(
        relay.registry().pairing_of(&ParticipantId::from("usuario-a")),
        Some(Pairing::new("usuario-a", "usuario-f"))
    );

    // A later alert still lands in the episode that is already open.
    a.send(&relay, role("companion"), "ayuda otra vez");
    assert_eq!(relay.escalations().open_channels().len(), 1);

    let closed = close_for(&relay, &c, "usuario-a");

    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].id, channel.id);
    assert!(relay.escalations().channel(&pairing_key()).is_none());
    assert_eq!(relay.escalations().history(&pairing_key()).len(), 1);
}
