//! WebSocket message types for the intercom relay.
//!
//! These types define the protocol between connected participants
//! (primary user, companion, emergency operator) and the relay.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Shared Types
// ============================================================================

/// Role a participant announces when registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The person whose messages are monitored for distress.
    Primary,
    /// The paired caregiver.
    Companion,
    /// Emergency operator receiving escalated alerts.
    Operator,
}

impl Role {
    /// The other side of a pairing, if this role takes part in one.
    pub fn partner_role(self) -> Option<Role> {
        match self {
            Role::Primary => Some(Role::Companion),
            Role::Companion => Some(Role::Primary),
            Role::Operator => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Companion => write!(f, "companion"),
            Role::Operator => write!(f, "operator"),
        }
    }
}

/// Where a message should go: a specific participant or everyone holding a role.
///
/// Serialized as `{"participant": "id"}` or `{"role": "companion"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Participant(String),
    Role(Role),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Participant(id) => write!(f, "{id}"),
            Destination::Role(role) => write!(f, "role:{role}"),
        }
    }
}

/// Why an escalation channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// An operator closed the channel explicitly.
    Operator,
    /// No message touched the channel before the idle timeout expired.
    IdleTimeout,
}

/// Machine readable error codes carried by [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedMessage,
    NotRegistered,
    DuplicateRoleConflict,
    Forbidden,
    UnknownDestination,
    NoOperatorAvailable,
    Internal,
}

/// Escalation metadata attached to copies delivered through an escalation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTag {
    /// Episode ID of the escalation channel.
    pub channel_id: Uuid,
    /// Participant whose message raised the alert.
    pub raised_by: String,
    /// The raiser's paired partner, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner: Option<String>,
}

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Events sent from the relay to a connected participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// WebSocket connection established.
    Connected { connection_id: Uuid },

    /// Heartbeat/keepalive ping.
    Ping,

    /// Registration accepted.
    Registered {
        participant_id: String,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        paired_with: Option<String>,
    },

    /// Another connection registered under the same participant ID.
    /// This connection no longer receives or routes messages.
    Superseded { participant_id: String },

    /// A relayed chat message.
    Message {
        id: Uuid,
        from: String,
        from_role: Role,
        to: Destination,
        body: String,
        timestamp: DateTime<Utc>,
        alerted: bool,
        /// Present when this copy was delivered through an escalation channel.
        #[serde(skip_serializing_if = "Option::is_none")]
        escalation: Option<EscalationTag>,
    },

    /// The escalation channel this participant belonged to was closed.
    EscalationClosed { channel_id: Uuid, reason: CloseReason },

    /// A frame from this connection was rejected.
    Error { code: ErrorCode, message: String },
}

// ============================================================================
// Commands (Client -> Server)
// ============================================================================

/// Commands sent from a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Pong response to ping.
    Pong,

    /// Announce (or re-announce) who this connection speaks for.
    Register {
        participant_id: String,
        role: Role,
        /// Participant to pair with (primary <-> companion).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partner: Option<String>,
    },

    /// Send a chat message.
    Send {
        /// Optional sender identity; must match the registration when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Optional sender role; must match the registration when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        to: Destination,
        body: String,
    },

    /// Close the escalation channel that involves the given participant (operators only).
    CloseEscalation { participant_id: String },
}
