//! Participant identities and the messages routed between them.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use intercom_protocol::{Destination, EscalationTag, Role, ServerEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::AlertPolicy;

/// Opaque, stable participant identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ParticipantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An inbound message as parsed at ingress, before classification.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: ParticipantId,
    pub sender_role: Role,
    pub destination: Destination,
    pub body: String,
}

impl Envelope {
    pub fn new(
        sender: impl Into<ParticipantId>,
        sender_role: Role,
        destination: Destination,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            sender_role,
            destination,
            body: body.into(),
        }
    }
}

/// A classified message. Immutable: the `alerted` flag is fixed when the
/// message is built and there is no way to clear it afterwards.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    sender: ParticipantId,
    sender_role: Role,
    destination: Destination,
    body: String,
    timestamp: DateTime<Utc>,
    alerted: bool,
}

impl Message {
    /// Stamp an envelope with an ID and timestamp and run it through the alert policy.
    pub fn classify(envelope: Envelope, policy: &dyn AlertPolicy) -> Self {
        let alerted = policy.classify(&envelope.body);
        Self {
            id: Uuid::new_v4(),
            sender: envelope.sender,
            sender_role: envelope.sender_role,
            destination: envelope.destination,
            body: envelope.body,
            timestamp: Utc::now(),
            alerted,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender(&self) -> &ParticipantId {
        &self.sender
    }

    pub fn sender_role(&self) -> Role {
        self.sender_role
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn alerted(&self) -> bool {
        self.alerted
    }

    /// Wire event for this message, optionally tagged as an escalation copy.
    pub fn to_event(&self, escalation: Option<EscalationTag>) -> ServerEvent {
        ServerEvent::Message {
            id: self.id,
            from: self.sender.to_string(),
            from_role: self.sender_role,
            to: self.destination.clone(),
            body: self.body.clone(),
            timestamp: self.timestamp,
            alerted: self.alerted,
            escalation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::KeywordPolicy;

    #[test]
    fn test_classify_sets_alerted() {
        let policy = KeywordPolicy::default();
        let msg = Message::classify(
            Envelope::new(
                "usuario-a",
                Role::Primary,
                Destination::Role(Role::Companion),
                "necesito AYUDA",
            ),
            &policy,
        );
        assert!(msg.alerted());
        assert_eq!(msg.sender().as_str(), "usuario-a");
    }

    #[test]
    fn test_event_carries_sender_identity() {
        let policy = KeywordPolicy::default();
        let msg = Message::classify(
            Envelope::new(
                "usuario-b",
                Role::Companion,
                Destination::Participant("usuario-a".to_string()),
                "buenos días",
            ),
            &policy,
        );

        match msg.to_event(None) {
            ServerEvent::Message {
                from,
                from_role,
                alerted,
                escalation,
                ..
            } => {
                assert_eq!(from, "usuario-b");
                assert_eq!(from_role, Role::Companion);
                assert!(!alerted);
                assert!(escalation.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
