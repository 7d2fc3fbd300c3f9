//! Router: resolves a message's destinations and performs the fan-out.
//!
//! Holds no state of its own. Every decision is taken from the registry,
//! the alert policy and the escalation manager at the moment of routing.

use std::collections::HashSet;
use std::sync::Arc;

use intercom_protocol::{Destination, EscalationTag, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::audit::{AlertNotice, AuditRecord, AuditSink};
use crate::error::{DeliveryError, RelayError};
use crate::escalation::{EscalationChannel, EscalationKey, EscalationManager};
use crate::message::{Envelope, Message, ParticipantId};
use crate::policy::AlertPolicy;
use crate::registry::{ConnectionId, ResolvedConnection, SessionRegistry, Target};
use crate::stats::{RelayStats, bump};

/// Who receives an operator's reply while an escalation is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorReplyPolicy {
    /// Only the participant(s) who raised the alert.
    #[default]
    AlertingParticipant,
    /// Both members of the pairing, keeping the companion informed.
    Pairing,
}

/// How a copy reached its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    /// The message's declared destination.
    Direct,
    /// Through an escalation channel.
    Escalation,
}

/// One attempted send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub participant: ParticipantId,
    pub connection: ConnectionId,
    pub path: DeliveryPath,
    pub result: Result<(), DeliveryError>,
}

/// Escalation side of a routing call.
#[derive(Debug, Clone)]
pub struct EscalationReport {
    pub channel_id: Uuid,
    pub key: EscalationKey,
    /// True when this message opened the channel.
    pub opened: bool,
    pub operator: Option<ParticipantId>,
    pub operator_available: bool,
}

/// Everything that happened while routing one message.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub message: Message,
    pub deliveries: Vec<Delivery>,
    pub escalation: Option<EscalationReport>,
    /// Per-destination problems. None of them stopped the other deliveries.
    pub issues: Vec<RelayError>,
}

impl RoutingOutcome {
    fn new(message: Message) -> Self {
        Self {
            message,
            deliveries: Vec::new(),
            escalation: None,
            issues: Vec::new(),
        }
    }

    /// Participants that were successfully sent a copy over `path`.
    pub fn delivered_via(&self, path: DeliveryPath) -> Vec<&ParticipantId> {
        self.deliveries
            .iter()
            .filter(|d| d.path == path && d.result.is_ok())
            .map(|d| &d.participant)
            .collect()
    }

    pub fn delivered_to(&self, participant: &ParticipantId) -> bool {
        self.deliveries
            .iter()
            .any(|d| &d.participant == participant && d.result.is_ok())
    }

    pub fn no_operator_available(&self) -> bool {
        self.issues
            .iter()
            .any(|e| matches!(e, RelayError::NoOperatorAvailable { .. }))
    }
}

pub struct Router {
    registry: Arc<SessionRegistry>,
    policy: Arc<dyn AlertPolicy>,
    escalations: EscalationManager,
    sink: Arc<dyn AuditSink>,
    stats: Arc<RelayStats>,
    reply_policy: OperatorReplyPolicy,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        policy: Arc<dyn AlertPolicy>,
        escalations: EscalationManager,
        sink: Arc<dyn AuditSink>,
        stats: Arc<RelayStats>,
        reply_policy: OperatorReplyPolicy,
    ) -> Self {
        Self {
            registry,
            policy,
            escalations,
            sink,
            stats,
            reply_policy,
        }
    }

    pub fn reply_policy(&self) -> OperatorReplyPolicy {
        self.reply_policy
    }

    /// Classify and deliver one message.
    ///
    /// Direct delivery and escalation delivery are independent: an alert
    /// never suppresses the normal destination. Failures are collected per
    /// destination in [`RoutingOutcome::issues`].
    pub fn route(&self, envelope: Envelope) -> RoutingOutcome {
        let message = Message::classify(envelope, self.policy.as_ref());
        bump(&self.stats.messages_routed);
        if message.alerted() {
            bump(&self.stats.messages_alerted);
        }
        self.sink.record(&AuditRecord::from(&message));

        let mut outcome = RoutingOutcome::new(message);

        if outcome.message.sender_role() == Role::Operator
            && let Some(channel) = self.reply_channel(&outcome.message)
        {
            self.route_operator_reply(&mut outcome, &channel);
            return outcome;
        }

        let delivered = self.route_direct(&mut outcome);

        if outcome.message.alerted() && outcome.message.sender_role() != Role::Operator {
            self.route_escalation(&mut outcome, &delivered);
        }

        outcome
    }

    /// Live connections for the message's declared destination, sender excluded.
    fn direct_targets(&self, message: &Message) -> Vec<ResolvedConnection> {
        let sender = message.sender();
        let targets = match message.destination() {
            Destination::Participant(id) => {
                self.registry
                    .resolve(&Target::Participant(ParticipantId::from(id.as_str())))
            }
            Destination::Role(Role::Operator) => self.registry.resolve(&Target::Role(Role::Operator)),
            Destination::Role(role) => {
                let partner = self
                    .registry
                    .pairing_of(sender)
                    .and_then(|pairing| pairing.member(*role).cloned())
                    .filter(|member| member != sender);
                match partner {
                    Some(partner) => self.registry.resolve(&Target::Participant(partner)),
                    None => self.registry.resolve(&Target::Role(*role)),
                }
            }
        };

        targets
            .into_iter()
            .filter(|conn| &conn.participant != sender)
            .collect()
    }

    /// Deliver to the declared destination. Returns the connections reached.
    fn route_direct(&self, outcome: &mut RoutingOutcome) -> HashSet<ConnectionId> {
        let targets = self.direct_targets(&outcome.message);
        let mut attempted = HashSet::new();

        if targets.is_empty() {
            let destination = outcome.message.destination().to_string();
            bump(&self.stats.unknown_destination);
            debug!(
                message_id = %outcome.message.id(),
                sender = %outcome.message.sender(),
                destination = %destination,
                "No live connection for destination, delivery skipped"
            );
            outcome.issues.push(RelayError::UnknownDestination(destination));
            return attempted;
        }

        let event = outcome.message.to_event(None);
        for conn in targets {
            if attempted.insert(conn.handle.id()) {
                self.deliver(outcome, &conn, event.clone(), DeliveryPath::Direct);
            }
        }
        attempted
    }

    fn route_escalation(&self, outcome: &mut RoutingOutcome, already: &HashSet<ConnectionId>) {
        let sender = outcome.message.sender().clone();
        let key = self.escalations.key_for(&sender);
        let ensured = self.escalations.ensure_open(&key, &sender);
        let members = ensured.members;
        let channel_id = ensured.channel.id;

        let tag = EscalationTag {
            channel_id,
            raised_by: sender.to_string(),
            partner: key.partner_of(&sender).map(ToString::to_string),
        };
        let event = outcome.message.to_event(Some(tag));

        let mut attempted = already.clone();
        for conn in &members.connections {
            if conn.participant == sender || !attempted.insert(conn.handle.id()) {
                continue;
            }
            self.deliver(outcome, conn, event.clone(), DeliveryPath::Escalation);
        }

        if !members.operator_available {
            bump(&self.stats.no_operator_available);
            error!(
                safety_alert = true,
                channel_id = %channel_id,
                key = %key,
                raised_by = %sender,
                message_id = %outcome.message.id(),
                "Escalation raised but no operator is available"
            );
            self.sink.alert(&AlertNotice::NoOperatorAvailable {
                channel_id,
                key: key.clone(),
                raised_by: sender.clone(),
                message_id: outcome.message.id(),
                at: outcome.message.timestamp(),
            });
            outcome.issues.push(RelayError::NoOperatorAvailable {
                channel_id,
                raised_by: sender.to_string(),
            });
        }

        outcome.escalation = Some(EscalationReport {
            channel_id,
            key,
            opened: ensured.opened,
            operator: members.operator,
            operator_available: members.operator_available,
        });
    }

    /// Open channel an operator's message belongs to, if any.
    fn reply_channel(&self, message: &Message) -> Option<EscalationChannel> {
        match message.destination() {
            Destination::Participant(id) => self
                .escalations
                .open_channel_involving(&ParticipantId::from(id.as_str())),
            Destination::Role(Role::Operator) => None,
            Destination::Role(_) => self.escalations.open_channel_for_operator(message.sender()),
        }
    }

    fn route_operator_reply(&self, outcome: &mut RoutingOutcome, channel: &EscalationChannel) {
        let mut recipients: Vec<ParticipantId> = match outcome.message.destination() {
            Destination::Participant(id) => vec![ParticipantId::from(id.as_str())],
            Destination::Role(role) => match &channel.key {
                // The addressed slot of the pairing, even if it did not raise the alert.
                EscalationKey::Pairing(pairing) => match pairing.member(*role) {
                    Some(member) => vec![member.clone()],
                    None => channel.alerting.iter().cloned().collect(),
                },
                EscalationKey::Solo { .. } => channel.alerting.iter().cloned().collect(),
            },
        };
        if self.reply_policy == OperatorReplyPolicy::Pairing {
            recipients = channel.key.participants();
        }
        recipients.sort();
        recipients.dedup();

        self.escalations.touch(&channel.key);

        let tag = EscalationTag {
            channel_id: channel.id,
            raised_by: channel.raised_by.to_string(),
            partner: channel.key.partner_of(&channel.raised_by).map(ToString::to_string),
        };
        let event = outcome.message.to_event(Some(tag));

        let mut attempted = HashSet::new();
        for recipient in &recipients {
            let connections = self.registry.resolve(&Target::Participant(recipient.clone()));
            if connections.is_empty() {
                bump(&self.stats.unknown_destination);
                outcome
                    .issues
                    .push(RelayError::UnknownDestination(recipient.to_string()));
                continue;
            }
            for conn in connections {
                if attempted.insert(conn.handle.id()) {
                    self.deliver(outcome, &conn, event.clone(), DeliveryPath::Escalation);
                }
            }
        }

        debug!(
            channel_id = %channel.id,
            operator = %outcome.message.sender(),
            recipients = recipients.len(),
            policy = ?self.reply_policy,
            "Operator reply routed through escalation channel"
        );

        outcome.escalation = Some(EscalationReport {
            channel_id: channel.id,
            key: channel.key.clone(),
            opened: false,
            operator: Some(outcome.message.sender().clone()),
            operator_available: true,
        });
    }

    fn deliver(
        &self,
        outcome: &mut RoutingOutcome,
        conn: &ResolvedConnection,
        event: intercom_protocol::ServerEvent,
        path: DeliveryPath,
    ) {
        let result = conn.handle.send(event);
        match result {
            Ok(()) => bump(&self.stats.deliveries_succeeded),
            Err(source) => {
                bump(&self.stats.deliveries_failed);
                warn!(
                    message_id = %outcome.message.id(),
                    participant = %conn.participant,
                    connection = %conn.handle.id(),
                    path = ?path,
                    "Delivery failed: {}",
                    source
                );
                outcome.issues.push(RelayError::Delivery {
                    participant: conn.participant.to_string(),
                    source,
                });
            }
        }
        outcome.deliveries.push(Delivery {
            participant: conn.participant.clone(),
            connection: conn.handle.id(),
            path,
            result,
        });
    }
}
