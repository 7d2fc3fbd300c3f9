//! Relay facade: the boundary a transport talks to.
//!
//! A transport calls [`Relay::connect`] when a peer connects,
//! [`Relay::handle_frame`] for each inbound text frame and
//! [`Relay::disconnect`] when the peer goes away. The relay never owns the
//! transport; it only keeps weak senders to each connection.

use std::io;
use std::sync::Arc;

use intercom_protocol::{ClientCommand, CloseReason, Destination, Role, ServerEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, FanoutSink, JsonlAuditSink, TracingAuditSink};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::escalation::{EscalationChannel, EscalationManager};
use crate::message::{Envelope, ParticipantId};
use crate::policy::AlertPolicy;
use crate::registry::{ConnectionHandle, ConnectionId, Pairing, Registration, SessionRegistry};
use crate::router::{Router, RoutingOutcome};
use crate::stats::{RelayStats, StatsSnapshot, bump};

/// Errors building a relay from configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid alert keywords: {0}")]
    Policy(#[from] regex::Error),

    #[error("failed to open audit log: {0}")]
    Audit(#[from] io::Error),

    #[error("static pairing rejected: {0}")]
    Pairing(#[from] RelayError),
}

/// Transport-side end of one connection.
///
/// The transport holds this (the only strong sender) for as long as the
/// peer is connected and drains the receiver returned by [`Relay::connect`].
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event straight to this connection.
    pub fn notify(&self, event: ServerEvent) -> Result<(), crate::error::DeliveryError> {
        ConnectionHandle::new(self.id, &self.tx).send(event)
    }
}

/// What a handled frame did.
#[derive(Debug)]
pub enum FrameOutcome {
    Pong,
    Registered(Registration),
    Routed(Box<RoutingOutcome>),
    /// Episodes the close ended; empty when nothing was open.
    EscalationClosed(Vec<EscalationChannel>),
}

pub struct Relay {
    registry: Arc<SessionRegistry>,
    escalations: EscalationManager,
    router: Router,
    stats: Arc<RelayStats>,
    audit_log: Option<Arc<JsonlAuditSink>>,
    connection_buffer: usize,
}

impl Relay {
    /// Build the relay core from configuration and apply static pairings.
    pub async fn new(config: &RelayConfig) -> Result<Self, SetupError> {
        let policy = config.alerts.build_policy()?;
        let mut fanout = FanoutSink::new().with(Arc::new(TracingAuditSink));
        let mut audit_log = None;
        if let Some(path) = &config.audit.path {
            let sink = Arc::new(JsonlAuditSink::open(path).await?);
            info!(path = %sink.path().display(), "Writing audit log");
            fanout = fanout.with(sink.clone());
            audit_log = Some(sink);
        }

        let mut relay = Self::with_parts(config, Arc::new(policy), Arc::new(fanout));
        relay.audit_log = audit_log;
        for pairing in &config.pairings {
            relay.registry.pair(Pairing::from(pairing))?;
        }
        Ok(relay)
    }

    /// Build the relay core around an explicit alert policy and audit sink.
    pub fn with_parts(
        config: &RelayConfig,
        policy: Arc<dyn AlertPolicy>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry.role_conflict));
        let stats = Arc::new(RelayStats::new());
        let escalations = EscalationManager::new(
            registry.clone(),
            config.escalation.settings(),
            sink.clone(),
            stats.clone(),
        );

        info!(
            policy = %policy.describe(),
            reply_policy = ?config.escalation.reply_policy,
            role_conflict = ?config.registry.role_conflict,
            "Relay core ready"
        );

        let router = Router::new(
            registry.clone(),
            policy,
            escalations.clone(),
            sink,
            stats.clone(),
            config.escalation.reply_policy,
        );

        Self {
            registry,
            escalations,
            router,
            stats,
            audit_log: None,
            connection_buffer: config.server.connection_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn escalations(&self) -> &EscalationManager {
        &self.escalations
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for queued audit lines to reach the audit file, if one is configured.
    pub async fn flush_audit(&self) {
        if let Some(sink) = &self.audit_log {
            sink.flush().await;
        }
    }

    /// A peer connected. The receiver yields every event queued for it.
    pub fn connect(&self) -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.connection_buffer);
        let connection = Connection {
            id: ConnectionId::new(),
            tx,
        };
        self.stats.connection_opened();
        debug!(connection = %connection.id, "Connection opened");
        (connection, rx)
    }

    /// A peer disconnected.
    pub fn disconnect(&self, connection: ConnectionId) -> Option<ParticipantId> {
        self.stats.connection_closed();
        self.registry.unregister(connection)
    }

    /// Parse and act on one inbound text frame.
    ///
    /// Rejected frames are never routed; the error is meant for the
    /// offending connection only.
    pub fn handle_frame(&self, connection: &Connection, raw: &str) -> RelayResult<FrameOutcome> {
        let command = match serde_json::from_str::<ClientCommand>(raw) {
            Ok(command) => command,
            Err(e) => {
                bump(&self.stats.malformed_rejected);
                debug!(connection = %connection.id, "Rejected unparsable frame: {}", e);
                return Err(RelayError::malformed(e.to_string()));
            }
        };

        let result = self.handle_command(connection, command);
        if let Err(RelayError::MalformedMessage(reason)) = &result {
            bump(&self.stats.malformed_rejected);
            debug!(connection = %connection.id, reason = %reason, "Rejected malformed frame");
        }
        result
    }

    fn handle_command(&self, connection: &Connection, command: ClientCommand) -> RelayResult<FrameOutcome> {
        match command {
            ClientCommand::Pong => Ok(FrameOutcome::Pong),

            ClientCommand::Register {
                participant_id,
                role,
                partner,
            } => {
                let participant_id = required_id("participant_id", &participant_id)?;
                let partner = partner
                    .as_deref()
                    .map(|p| required_id("partner", p))
                    .transpose()?;

                let registration = self.registry.register(
                    participant_id,
                    role,
                    partner,
                    ConnectionHandle::new(connection.id, &connection.tx),
                )?;

                let ack = ServerEvent::Registered {
                    participant_id: registration.participant_id.to_string(),
                    role: registration.role,
                    paired_with: registration.paired_with.as_ref().map(ToString::to_string),
                };
                if let Err(e) = connection.notify(ack) {
                    warn!(connection = %connection.id, "Failed to acknowledge registration: {}", e);
                }
                Ok(FrameOutcome::Registered(registration))
            }

            ClientCommand::Send {
                from,
                role,
                to,
                body,
            } => {
                let (sender, sender_role) = self
                    .registry
                    .participant_for(connection.id)
                    .ok_or(RelayError::NotRegistered)?;

                if let Some(from) = from
                    && from != sender.as_str()
                {
                    return Err(RelayError::malformed(format!(
                        "from {from} does not match registration {sender}"
                    )));
                }
                if let Some(role) = role
                    && role != sender_role
                {
                    return Err(RelayError::malformed(format!(
                        "role {role} does not match registration {sender_role}"
                    )));
                }
                if body.trim().is_empty() {
                    return Err(RelayError::malformed("body must not be empty"));
                }
                if let Destination::Participant(id) = &to
                    && id.trim().is_empty()
                {
                    return Err(RelayError::malformed("destination must not be empty"));
                }

                let outcome = self.router.route(Envelope::new(sender, sender_role, to, body));
                Ok(FrameOutcome::Routed(Box::new(outcome)))
            }

            ClientCommand::CloseEscalation { participant_id } => {
                let (operator, role) = self
                    .registry
                    .participant_for(connection.id)
                    .ok_or(RelayError::NotRegistered)?;
                if role != Role::Operator {
                    return Err(RelayError::forbidden("only operators can close escalations"));
                }
                let participant = required_id("participant_id", &participant_id)?;
                let closed = self
                    .escalations
                    .close_involving(&participant, CloseReason::Operator);
                info!(
                    operator = %operator,
                    participant = %participant,
                    closed = closed.len(),
                    "Operator closed escalation"
                );
                Ok(FrameOutcome::EscalationClosed(closed))
            }
        }
    }
}

fn required_id(field: &str, value: &str) -> RelayResult<ParticipantId> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RelayError::malformed(format!("{field} must not be empty")));
    }
    Ok(ParticipantId::from(trimmed))
}
