//! Session registry: who is connected, as whom, and who is paired with whom.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use intercom_protocol::{Role, ServerEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, RelayError, RelayResult};
use crate::message::ParticipantId;

/// Identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Weak back-reference to a live transport connection.
///
/// The transport owns the strong sender; once it drops it, every send
/// through this handle fails with [`DeliveryError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::WeakSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: &mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            tx: tx.downgrade(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event for this connection without waiting.
    pub fn send(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        let tx = self.tx.upgrade().ok_or(DeliveryError::ConnectionClosed)?;
        tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Backpressure,
            TrySendError::Closed(_) => DeliveryError::ConnectionClosed,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.tx.upgrade().is_some_and(|tx| !tx.is_closed())
    }
}

/// Presence of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Connected,
    Disconnected,
}

/// What to do when a pairing claim collides with an existing pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleConflictPolicy {
    /// Log a warning and replace the existing pairing.
    #[default]
    LastWriteWins,
    /// Refuse the claim with `DuplicateRoleConflict`.
    Reject,
}

/// Stable 1:1 relation between a primary user and their companion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pairing {
    pub primary: ParticipantId,
    pub companion: ParticipantId,
}

impl Pairing {
    pub fn new(primary: impl Into<ParticipantId>, companion: impl Into<ParticipantId>) -> Self {
        Self {
            primary: primary.into(),
            companion: companion.into(),
        }
    }

    /// Build a pairing from one side's point of view.
    fn from_claim(role: Role, participant: &ParticipantId, partner: &ParticipantId) -> Option<Self> {
        match role {
            Role::Primary => Some(Self::new(participant.clone(), partner.clone())),
            Role::Companion => Some(Self::new(partner.clone(), participant.clone())),
            Role::Operator => None,
        }
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        &self.primary == id || &self.companion == id
    }

    /// Slot held by `id` in this pairing.
    pub fn role_of(&self, id: &ParticipantId) -> Option<Role> {
        if &self.primary == id {
            Some(Role::Primary)
        } else if &self.companion == id {
            Some(Role::Companion)
        } else {
            None
        }
    }

    /// Member occupying `role`.
    pub fn member(&self, role: Role) -> Option<&ParticipantId> {
        match role {
            Role::Primary => Some(&self.primary),
            Role::Companion => Some(&self.companion),
            Role::Operator => None,
        }
    }

    pub fn partner_of(&self, id: &ParticipantId) -> Option<&ParticipantId> {
        if &self.primary == id {
            Some(&self.companion)
        } else if &self.companion == id {
            Some(&self.primary)
        } else {
            None
        }
    }
}

impl fmt::Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.primary, self.companion)
    }
}

/// A participant record.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub connection: Option<ConnectionHandle>,
    pub presence: Presence,
    pub last_seen: DateTime<Utc>,
    /// Registration order, used to pick the most recent on-duty operator.
    seq: u64,
}

impl Participant {
    fn live_connection(&self) -> Option<&ConnectionHandle> {
        match (&self.connection, self.presence) {
            (Some(handle), Presence::Connected) if handle.is_alive() => Some(handle),
            _ => None,
        }
    }
}

/// Serializable view of a participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    pub role: Role,
    pub presence: Presence,
    pub last_seen: DateTime<Utc>,
}

/// What to resolve: a specific participant or everyone holding a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Participant(ParticipantId),
    Role(Role),
}

/// A live connection together with the participant it speaks for.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub participant: ParticipantId,
    pub handle: ConnectionHandle,
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub paired_with: Option<ParticipantId>,
    /// Connection that was replaced by this registration, if any.
    pub superseded: Option<ConnectionId>,
}

/// Lock-guarded keyed store of participants, their connections and pairings.
///
/// Participants and the connection index are sharded maps, so mutations are
/// serialized per participant ID. Pairings touch two keys at once and live
/// behind a single lock.
pub struct SessionRegistry {
    /// Participant ID -> participant record
    participants: DashMap<ParticipantId, Participant>,

    /// Connection ID -> participant the connection is bound to
    connections: DashMap<ConnectionId, ParticipantId>,

    /// Participant ID -> pairing (indexed from both members)
    pairings: RwLock<HashMap<ParticipantId, Pairing>>,

    conflict_policy: RoleConflictPolicy,
    seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new(conflict_policy: RoleConflictPolicy) -> Self {
        Self {
            participants: DashMap::new(),
            connections: DashMap::new(),
            pairings: RwLock::new(HashMap::new()),
            conflict_policy,
            seq: AtomicU64::new(0),
        }
    }

    pub fn conflict_policy(&self) -> RoleConflictPolicy {
        self.conflict_policy
    }

    fn read_pairings(&self) -> RwLockReadGuard<'_, HashMap<ParticipantId, Pairing>> {
        self.pairings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pairings(&self) -> RwLockWriteGuard<'_, HashMap<ParticipantId, Pairing>> {
        self.pairings.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `handle` to a participant and role.
    ///
    /// Any previous connection of the same participant is superseded and
    /// notified. When `partner` is given the pairing is (re)established
    /// first, so a rejected claim leaves the registry untouched.
    pub fn register(
        &self,
        participant_id: ParticipantId,
        role: Role,
        partner: Option<ParticipantId>,
        handle: ConnectionHandle,
    ) -> RelayResult<Registration> {
        if let Some(partner) = &partner {
            self.validate_partner(&participant_id, role, partner)?;
            if let Some(pairing) = Pairing::from_claim(role, &participant_id, partner) {
                self.pair(pairing)?;
            }
        }

        // Release whatever this connection was bound to before.
        if let Some(previous) = self.connections.get(&handle.id()).map(|p| p.value().clone())
            && previous != participant_id
        {
            self.detach(&previous, handle.id());
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (superseded, previous_role) = {
            let mut entry = self
                .participants
                .entry(participant_id.clone())
                .or_insert_with(|| Participant {
                    id: participant_id.clone(),
                    role,
                    connection: None,
                    presence: Presence::Disconnected,
                    last_seen: Utc::now(),
                    seq,
                });

            let superseded = entry
                .connection
                .take()
                .filter(|old| old.id() != handle.id());
            let previous_role = entry.role;

            entry.role = role;
            entry.connection = Some(handle.clone());
            entry.presence = Presence::Connected;
            entry.last_seen = Utc::now();
            entry.seq = seq;

            (superseded, previous_role)
        };

        self.connections.insert(handle.id(), participant_id.clone());

        if previous_role != role {
            info!(
                participant = %participant_id,
                from = %previous_role,
                to = %role,
                "Participant changed role"
            );
        }
        self.drop_stale_pairing(&participant_id, role);

        if let Some(old) = &superseded {
            self.connections.remove(&old.id());
            warn!(
                participant = %participant_id,
                old_connection = %old.id(),
                new_connection = %handle.id(),
                "Connection superseded by newer registration"
            );
            if old
                .send(ServerEvent::Superseded {
                    participant_id: participant_id.to_string(),
                })
                .is_err()
            {
                debug!(connection = %old.id(), "Superseded connection already gone");
            }
        }

        let paired_with = self
            .pairing_of(&participant_id)
            .and_then(|p| p.partner_of(&participant_id).cloned());

        info!(
            participant = %participant_id,
            role = %role,
            connection = %handle.id(),
            paired_with = ?paired_with.as_ref().map(ParticipantId::as_str),
            "Registered participant"
        );

        Ok(Registration {
            participant_id,
            role,
            paired_with,
            superseded: superseded.map(|old| old.id()),
        })
    }

    fn validate_partner(
        &self,
        participant_id: &ParticipantId,
        role: Role,
        partner: &ParticipantId,
    ) -> RelayResult<()> {
        let Some(expected) = role.partner_role() else {
            return Err(RelayError::malformed("operators cannot declare a partner"));
        };
        if partner == participant_id {
            return Err(RelayError::malformed("a participant cannot pair with itself"));
        }
        if let Some(existing) = self.participants.get(partner)
            && existing.role != expected
        {
            return Err(RelayError::malformed(format!(
                "{partner} is registered as {}, expected {expected}",
                existing.role
            )));
        }
        Ok(())
    }

    /// Remove the binding between `participant` and `connection` if it is
    /// still the participant's live connection.
    fn detach(&self, participant: &ParticipantId, connection: ConnectionId) -> bool {
        let Some(mut entry) = self.participants.get_mut(participant) else {
            return false;
        };
        if entry.connection.as_ref().map(ConnectionHandle::id) != Some(connection) {
            return false;
        }
        entry.connection = None;
        entry.presence = Presence::Disconnected;
        entry.last_seen = Utc::now();
        true
    }

    /// Dissolve a pairing in which `participant` no longer fits its slot.
    fn drop_stale_pairing(&self, participant: &ParticipantId, role: Role) {
        let mut table = self.write_pairings();
        let Some(pairing) = table.get(participant).cloned() else {
            return;
        };
        if pairing.role_of(participant) == Some(role) {
            return;
        }
        table.remove(&pairing.primary);
        table.remove(&pairing.companion);
        warn!(
            participant = %participant,
            pairing = %pairing,
            "Dissolved pairing after role change"
        );
    }

    /// Establish a pairing. Existing pairings of either member are replaced
    /// or refused according to the conflict policy.
    ///
    /// Returns the pairings that were displaced.
    pub fn pair(&self, pairing: Pairing) -> RelayResult<Vec<Pairing>> {
        let mut table = self.write_pairings();

        let mut displaced: Vec<Pairing> = [&pairing.primary, &pairing.companion]
            .into_iter()
            .filter_map(|member| table.get(member))
            .filter(|existing| **existing != pairing)
            .cloned()
            .collect();
        displaced.sort();
        displaced.dedup();

        if let Some(first) = displaced.first() {
            match self.conflict_policy {
                RoleConflictPolicy::Reject => {
                    return Err(RelayError::DuplicateRoleConflict {
                        participant: pairing.primary.to_string(),
                        partner: pairing.companion.to_string(),
                        existing: first.to_string(),
                    });
                }
                RoleConflictPolicy::LastWriteWins => {
                    for old in &displaced {
                        warn!(
                            pairing = %pairing,
                            displaced = %old,
                            "Duplicate role conflict, superseding existing pairing"
                        );
                    }
                }
            }
        }

        for old in &displaced {
            for member in [&old.primary, &old.companion] {
                if table.get(member) == Some(old) {
                    table.remove(member);
                }
            }
        }

        table.insert(pairing.primary.clone(), pairing.clone());
        table.insert(pairing.companion.clone(), pairing.clone());
        debug!(pairing = %pairing, "Pairing established");

        Ok(displaced)
    }

    /// Pairing the participant belongs to, if any.
    pub fn pairing_of(&self, participant: &ParticipantId) -> Option<Pairing> {
        self.read_pairings().get(participant).cloned()
    }

    /// All pairings, each listed once.
    pub fn pairings(&self) -> Vec<Pairing> {
        let mut all: Vec<Pairing> = self.read_pairings().values().cloned().collect();
        all.sort();
        all.dedup();
        all
    }

    /// Live connections for a participant or role. Empty when nobody matching
    /// is connected.
    pub fn resolve(&self, target: &Target) -> Vec<ResolvedConnection> {
        match target {
            Target::Participant(id) => self
                .participants
                .get(id)
                .and_then(|p| {
                    p.live_connection().map(|handle| ResolvedConnection {
                        participant: p.id.clone(),
                        handle: handle.clone(),
                    })
                })
                .into_iter()
                .collect(),
            Target::Role(role) => self
                .participants
                .iter()
                .filter(|p| p.role == *role)
                .filter_map(|p| {
                    p.live_connection().map(|handle| ResolvedConnection {
                        participant: p.id.clone(),
                        handle: handle.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Called when a transport closes. Marks the owning participant
    /// disconnected unless the connection was already superseded.
    ///
    /// Returns the participant that went offline.
    pub fn unregister(&self, connection: ConnectionId) -> Option<ParticipantId> {
        let (_, participant) = self.connections.remove(&connection)?;
        if self.detach(&participant, connection) {
            info!(
                participant = %participant,
                connection = %connection,
                "Participant disconnected"
            );
            Some(participant)
        } else {
            None
        }
    }

    /// Participant and role a connection currently speaks for. Superseded
    /// connections resolve to nothing.
    pub fn participant_for(&self, connection: ConnectionId) -> Option<(ParticipantId, Role)> {
        let participant = self.connections.get(&connection)?.value().clone();
        let entry = self.participants.get(&participant)?;
        if entry.connection.as_ref().map(ConnectionHandle::id) == Some(connection) {
            Some((entry.id.clone(), entry.role))
        } else {
            None
        }
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<Participant> {
        self.participants.get(id).map(|p| p.value().clone())
    }

    pub fn is_connected(&self, id: &ParticipantId) -> bool {
        self.participants
            .get(id)
            .is_some_and(|p| p.live_connection().is_some())
    }

    /// The operator currently on duty, resolved fresh on every call: the
    /// preferred operator when connected, otherwise the most recently
    /// registered connected operator.
    pub fn on_duty_operator(&self, preferred: Option<&ParticipantId>) -> Option<ParticipantId> {
        if let Some(preferred) = preferred
            && let Some(entry) = self.participants.get(preferred)
            && entry.role == Role::Operator
            && entry.live_connection().is_some()
        {
            return Some(entry.id.clone());
        }

        self.participants
            .iter()
            .filter(|p| p.role == Role::Operator && p.live_connection().is_some())
            .max_by_key(|p| p.seq)
            .map(|p| p.id.clone())
    }

    /// Snapshot of every known participant.
    pub fn summaries(&self) -> Vec<ParticipantSummary> {
        let mut all: Vec<ParticipantSummary> = self
            .participants
            .iter()
            .map(|p| ParticipantSummary {
                id: p.id.clone(),
                role: p.role,
                presence: if p.live_connection().is_some() {
                    Presence::Connected
                } else {
                    Presence::Disconnected
                },
                last_seen: p.last_seen,
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn connected_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.live_connection().is_some())
            .count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RoleConflictPolicy::default())
    }
}
