//! Escalation manager: lifecycle of the emergency channel opened when a
//! message raises an alert.
//!
//! Per key the channel goes `NoChannel -> Open -> Closed -> NoChannel`.
//! A new alert after a close opens a fresh episode with its own ID; closed
//! episodes are kept in per-key history.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use intercom_protocol::{CloseReason, ServerEvent};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AlertNotice, AuditSink};
use crate::message::ParticipantId;
use crate::registry::{Pairing, ResolvedConnection, SessionRegistry, Target};
use crate::stats::{RelayStats, bump};

/// What an escalation channel is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationKey {
    /// A paired primary/companion.
    Pairing(Pairing),
    /// A participant without a pairing who raised an alert.
    Solo { participant: ParticipantId },
}

impl EscalationKey {
    /// Key for alerts raised by `participant`, given its current pairing.
    pub fn for_participant(registry: &SessionRegistry, participant: &ParticipantId) -> Self {
        match registry.pairing_of(participant) {
            Some(pairing) => Self::Pairing(pairing),
            None => Self::Solo {
                participant: participant.clone(),
            },
        }
    }

    pub fn involves(&self, participant: &ParticipantId) -> bool {
        match self {
            Self::Pairing(pairing) => pairing.contains(participant),
            Self::Solo { participant: p } => p == participant,
        }
    }

    /// The other pairing member, if any.
    pub fn partner_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        match self {
            Self::Pairing(pairing) => pairing.partner_of(participant),
            Self::Solo { .. } => None,
        }
    }

    /// Every non-operator participant covered by this key.
    pub fn participants(&self) -> Vec<ParticipantId> {
        match self {
            Self::Pairing(pairing) => vec![pairing.primary.clone(), pairing.companion.clone()],
            Self::Solo { participant } => vec![participant.clone()],
        }
    }
}

impl fmt::Display for EscalationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pairing(pairing) => write!(f, "pairing:{pairing}"),
            Self::Solo { participant } => write!(f, "solo:{participant}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Open,
    Closed,
}

/// One escalation episode.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationChannel {
    pub id: Uuid,
    pub key: EscalationKey,
    /// Participant whose message opened the channel.
    pub raised_by: ParticipantId,
    /// Everyone who raised an alert while the channel was open.
    pub alerting: BTreeSet<ParticipantId>,
    /// Operator bound to the channel, if one was on duty.
    pub operator: Option<ParticipantId>,
    pub state: ChannelState,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

/// Result of [`EscalationManager::ensure_open`].
#[derive(Debug, Clone)]
pub struct EnsureOpen {
    pub channel: EscalationChannel,
    /// True when this call created the episode.
    pub opened: bool,
    /// Members of `channel`, resolved under the same entry lock.
    pub members: Members,
}

/// Live connections of a channel's members, resolved at call time.
#[derive(Debug, Clone, Default)]
pub struct Members {
    pub channel_id: Option<Uuid>,
    pub operator: Option<ParticipantId>,
    pub connections: Vec<ResolvedConnection>,
    /// False when no operator connection could be resolved.
    pub operator_available: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EscalationSettings {
    /// Operator to bind when connected; otherwise the latest connected operator.
    pub preferred_operator: Option<ParticipantId>,
    /// Close channels that see no traffic for this long.
    pub idle_timeout: Option<Duration>,
}

struct OpenChannel {
    channel: EscalationChannel,
    idle: Option<CancellationToken>,
}

struct Inner {
    registry: Arc<SessionRegistry>,
    settings: EscalationSettings,
    sink: Arc<dyn AuditSink>,
    stats: Arc<RelayStats>,

    /// Key -> currently open episode
    open: DashMap<EscalationKey, OpenChannel>,

    /// Key -> closed episodes, oldest first
    history: DashMap<EscalationKey, Vec<EscalationChannel>>,
}

/// Owns escalation channels. Cheap to clone.
#[derive(Clone)]
pub struct EscalationManager {
    inner: Arc<Inner>,
}

impl EscalationManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        settings: EscalationSettings,
        sink: Arc<dyn AuditSink>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                settings,
                sink,
                stats,
                open: DashMap::new(),
                history: DashMap::new(),
            }),
        }
    }

    fn on_duty_operator(&self) -> Option<ParticipantId> {
        self.inner
            .registry
            .on_duty_operator(self.inner.settings.preferred_operator.as_ref())
    }

    /// Return the open channel for `key`, opening a new episode if there is none.
    ///
    /// The on-duty operator is resolved from the registry at this moment. A
    /// channel opens even when no operator is connected.
    pub fn ensure_open(&self, key: &EscalationKey, alerting: &ParticipantId) -> EnsureOpen {
        let operator_now = self.on_duty_operator();
        let now = Utc::now();
        let mut opened = false;

        let (channel, members) = {
            let mut entry = self.inner.open.entry(key.clone()).or_insert_with(|| {
                opened = true;
                OpenChannel {
                    channel: EscalationChannel {
                        id: Uuid::new_v4(),
                        key: key.clone(),
                        raised_by: alerting.clone(),
                        alerting: BTreeSet::from([alerting.clone()]),
                        operator: operator_now.clone(),
                        state: ChannelState::Open,
                        opened_at: now,
                        last_activity: now,
                        closed_at: None,
                        close_reason: None,
                    },
                    idle: None,
                }
            });

            if !opened {
                entry.channel.alerting.insert(alerting.clone());
                entry.channel.last_activity = now;
            }
            let members = self.resolve_members(&mut entry.channel, operator_now.as_ref());

            let channel_id = entry.channel.id;
            if let Some(old) = entry.idle.take() {
                old.cancel();
            }
            entry.idle = self.arm_idle_timer(key, channel_id);
            (entry.channel.clone(), members)
        };

        if opened {
            bump(&self.inner.stats.escalations_opened);
            info!(
                channel_id = %channel.id,
                key = %key,
                raised_by = %alerting,
                operator = ?channel.operator.as_ref().map(ParticipantId::as_str),
                "Escalation channel opened"
            );
            self.inner.sink.alert(&AlertNotice::EscalationOpened {
                channel_id: channel.id,
                key: key.clone(),
                raised_by: alerting.clone(),
                operator: channel.operator.clone(),
                at: now,
            });
        }

        EnsureOpen {
            channel,
            opened,
            members,
        }
    }

    /// Replace a bound operator that is no longer connected.
    fn rebind_if_offline(&self, channel: &mut EscalationChannel, operator_now: Option<&ParticipantId>) {
        let bound_live = channel
            .operator
            .as_ref()
            .is_some_and(|op| self.inner.registry.is_connected(op));
        if bound_live {
            return;
        }
        if let Some(op) = operator_now
            && channel.operator.as_ref() != Some(op)
        {
            info!(
                channel_id = %channel.id,
                previous = ?channel.operator.as_ref().map(ParticipantId::as_str),
                operator = %op,
                "Rebinding escalation channel to on-duty operator"
            );
            channel.operator = Some(op.clone());
        }
    }

    /// Record traffic on an open channel and restart its idle timer.
    /// Returns false when no channel is open for `key`.
    pub fn touch(&self, key: &EscalationKey) -> bool {
        let Some(mut entry) = self.inner.open.get_mut(key) else {
            return false;
        };
        entry.channel.last_activity = Utc::now();
        let channel_id = entry.channel.id;
        if let Some(old) = entry.idle.take() {
            old.cancel();
        }
        entry.idle = self.arm_idle_timer(key, channel_id);
        true
    }

    fn arm_idle_timer(&self, key: &EscalationKey, channel_id: Uuid) -> Option<CancellationToken> {
        let timeout = self.inner.settings.idle_timeout?;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel_id = %channel_id, "No runtime available, idle timeout not armed");
            return None;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = key.clone();

        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        let manager = EscalationManager { inner };
                        if manager.close_episode(&key, channel_id, CloseReason::IdleTimeout).is_some() {
                            debug!(channel_id = %channel_id, "Escalation channel idle timeout fired");
                        }
                    }
                }
            }
        });

        Some(token)
    }

    /// Live connections of the channel's alerting participants and operator.
    ///
    /// Empty when no channel is open. The operator is re-resolved: a bound
    /// operator who went offline is replaced by whoever is on duty now.
    pub fn members_of(&self, key: &EscalationKey) -> Members {
        let operator_now = self.on_duty_operator();
        let Some(mut entry) = self.inner.open.get_mut(key) else {
            return Members::default();
        };
        self.resolve_members(&mut entry.channel, operator_now.as_ref())
    }

    /// Caller holds the entry for `channel`.
    fn resolve_members(
        &self,
        channel: &mut EscalationChannel,
        operator_now: Option<&ParticipantId>,
    ) -> Members {
        self.rebind_if_offline(channel, operator_now);

        let registry = &self.inner.registry;
        let mut connections: Vec<ResolvedConnection> = channel
            .alerting
            .iter()
            .flat_map(|id| registry.resolve(&Target::Participant(id.clone())))
            .collect();

        let operator_connections = channel
            .operator
            .as_ref()
            .map(|op| registry.resolve(&Target::Participant(op.clone())))
            .unwrap_or_default();
        let operator_available = !operator_connections.is_empty();
        connections.extend(operator_connections);

        Members {
            channel_id: Some(channel.id),
            operator: channel.operator.clone(),
            connections,
            operator_available,
        }
    }

    /// Key an alert or close from `participant` applies to.
    ///
    /// An open channel covering the participant wins over its current
    /// pairing, so a channel stays reachable after the pairing changes.
    pub fn key_for(&self, participant: &ParticipantId) -> EscalationKey {
        self.open_channel_involving(participant)
            .map(|channel| channel.key)
            .unwrap_or_else(|| EscalationKey::for_participant(&self.inner.registry, participant))
    }

    /// Close the open channel for `key`. Closing an already closed (or never
    /// opened) channel is a no-op returning `None`.
    pub fn close(&self, key: &EscalationKey, reason: CloseReason) -> Option<EscalationChannel> {
        let (_, open) = self.inner.open.remove(key)?;
        Some(self.finish_close(open, reason))
    }

    /// Close every open channel covering `participant`, whatever its
    /// pairing looks like now. Returns the closed episodes, oldest first.
    pub fn close_involving(
        &self,
        participant: &ParticipantId,
        reason: CloseReason,
    ) -> Vec<EscalationChannel> {
        let keys: Vec<EscalationKey> = self
            .inner
            .open
            .iter()
            .filter(|entry| entry.key().involves(participant))
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed: Vec<EscalationChannel> = keys
            .iter()
            .filter_map(|key| self.close(key, reason))
            .collect();
        closed.sort_by_key(|c| c.opened_at);
        closed
    }

    /// Close the channel for `key` only if it is still episode `channel_id`.
    fn close_episode(
        &self,
        key: &EscalationKey,
        channel_id: Uuid,
        reason: CloseReason,
    ) -> Option<EscalationChannel> {
        let (_, open) = self
            .inner
            .open
            .remove_if(key, |_, open| open.channel.id == channel_id)?;
        Some(self.finish_close(open, reason))
    }

    fn finish_close(&self, open: OpenChannel, reason: CloseReason) -> EscalationChannel {
        if let Some(token) = open.idle {
            token.cancel();
        }

        let mut channel = open.channel;
        let now = Utc::now();
        channel.state = ChannelState::Closed;
        channel.closed_at = Some(now);
        channel.close_reason = Some(reason);

        self.inner
            .history
            .entry(channel.key.clone())
            .or_default()
            .push(channel.clone());

        bump(&self.inner.stats.escalations_closed);
        info!(
            channel_id = %channel.id,
            key = %channel.key,
            reason = ?reason,
            "Escalation channel closed"
        );

        let registry = &self.inner.registry;
        let members = channel.alerting.iter().chain(channel.operator.iter());
        for member in members {
            for conn in registry.resolve(&Target::Participant(member.clone())) {
                let event = ServerEvent::EscalationClosed {
                    channel_id: channel.id,
                    reason,
                };
                if let Err(e) = conn.handle.send(event) {
                    debug!(participant = %member, "Failed to notify channel close: {}", e);
                }
            }
        }

        self.inner.sink.alert(&AlertNotice::EscalationClosed {
            channel_id: channel.id,
            key: channel.key.clone(),
            reason,
            at: now,
        });

        channel
    }

    /// The open channel for `key`, if any.
    pub fn channel(&self, key: &EscalationKey) -> Option<EscalationChannel> {
        self.inner.open.get(key).map(|open| open.channel.clone())
    }

    /// The open channel whose key covers `participant`, if any.
    pub fn open_channel_involving(&self, participant: &ParticipantId) -> Option<EscalationChannel> {
        self.inner
            .open
            .iter()
            .filter(|entry| entry.key().involves(participant))
            .map(|entry| entry.channel.clone())
            .max_by_key(|channel| channel.opened_at)
    }

    /// Newest open channel bound to `operator`.
    pub fn open_channel_for_operator(&self, operator: &ParticipantId) -> Option<EscalationChannel> {
        self.inner
            .open
            .iter()
            .filter(|entry| entry.channel.operator.as_ref() == Some(operator))
            .map(|entry| entry.channel.clone())
            .max_by_key(|channel| channel.opened_at)
    }

    /// All open channels, oldest first.
    pub fn open_channels(&self) -> Vec<EscalationChannel> {
        let mut channels: Vec<EscalationChannel> = self
            .inner
            .open
            .iter()
            .map(|entry| entry.channel.clone())
            .collect();
        channels.sort_by_key(|c| c.opened_at);
        channels
    }

    /// Closed episodes for `key`, oldest first.
    pub fn history(&self, key: &EscalationKey) -> Vec<EscalationChannel> {
        self.inner
            .history
            .get(key)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Cancel every pending idle timer.
    pub fn shutdown(&self) {
        for mut entry in self.inner.open.iter_mut() {
            if let Some(token) = entry.idle.take() {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::registry::{ConnectionHandle, ConnectionId, RoleConflictPolicy};
    use intercom_protocol::Role;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CaptureSink {
        alerts: Mutex<Vec<AlertNotice>>,
    }

    impl AuditSink for CaptureSink {
        fn record(&self, _record: &AuditRecord) {}

        fn alert(&self, notice: &AlertNotice) {
            self.alerts.lock().unwrap().push(notice.clone());
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        manager: EscalationManager,
        sink: Arc<CaptureSink>,
        stats: Arc<RelayStats>,
        // Strong senders keep the connections alive.
        senders: Vec<mpsc::Sender<ServerEvent>>,
    }

    impl Fixture {
        fn new(settings: EscalationSettings) -> Self {
            let registry = Arc::new(SessionRegistry::new(RoleConflictPolicy::LastWriteWins));
            registry.pair(Pairing::new("usuario-a", "usuario-b")).unwrap();
            let sink = Arc::new(CaptureSink::default());
            let stats = Arc::new(RelayStats::new());
            let manager =
                EscalationManager::new(registry.clone(), settings, sink.clone(), stats.clone());
            Self {
                registry,
                manager,
                sink,
                stats,
                senders: Vec::new(),
            }
        }

        fn connect(&mut self, id: &str, role: Role) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
            let (tx, rx) = mpsc::channel(16);
            let conn_id = ConnectionId::new();
            self.registry
                .register(ParticipantId::from(id), role, None, ConnectionHandle::new(conn_id, &tx))
                .unwrap();
            self.senders.push(tx);
            (conn_id, rx)
        }

        fn key(&self) -> EscalationKey {
            EscalationKey::for_participant(&self.registry, &ParticipantId::from("usuario-a"))
        }
    }

    #[test]
    fn test_ensure_open_creates_once() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let _live = fx.connect("agente-c", Role::Operator);
        let key = fx.key();
        let a = ParticipantId::from("usuario-a");

        assert!(fx.manager.channel(&key).is_none());

        let first = fx.manager.ensure_open(&key, &a);
        assert!(first.opened);
        assert_eq!(first.channel.state, ChannelState::Open);
        assert_eq!(first.channel.operator, Some(ParticipantId::from("agente-c")));

        let second = fx.manager.ensure_open(&key, &a);
        assert!(!second.opened);
        assert_eq!(second.channel.id, first.channel.id);
        assert_eq!(fx.stats.snapshot().escalations_opened, 1);
    }

    #[test]
    fn test_close_is_idempotent_and_reopen_is_a_new_episode() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let _live = fx.connect("agente-c", Role::Operator);
        let key = fx.key();
        let a = ParticipantId::from("usuario-a");

        let first = fx.manager.ensure_open(&key, &a).channel;
        let closed = fx.manager.close(&key, CloseReason::Operator).unwrap();
        assert_eq!(closed.id, first.id);
        assert_eq!(closed.state, ChannelState::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Operator));

        assert!(fx.manager.close(&key, CloseReason::Operator).is_none());
        assert!(fx.manager.channel(&key).is_none());

        let reopened = fx.manager.ensure_open(&key, &a);
        assert!(reopened.opened);
        assert_ne!(reopened.channel.id, first.id);
        assert_eq!(reopened.channel.state, ChannelState::Open);

        let history = fx.manager.history(&key);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, first.id);
        assert_eq!(fx.stats.snapshot().escalations_closed, 1);
    }

    #[test]
    fn test_members_without_operator() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let _live = fx.connect("usuario-a", Role::Primary);
        let key = fx.key();

        let opened = fx.manager.ensure_open(&key, &ParticipantId::from("usuario-a"));
        assert!(opened.channel.operator.is_none());

        let members = fx.manager.members_of(&key);
        assert!(!members.operator_available);
        assert_eq!(members.connections.len(), 1);
        assert_eq!(members.connections[0].participant.as_str(), "usuario-a");
    }

    #[test]
    fn test_members_rebind_to_current_operator() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let (first_conn, _first_rx) = fx.connect("agente-1", Role::Operator);
        let key = fx.key();
        fx.manager.ensure_open(&key, &ParticipantId::from("usuario-a"));

        fx.registry.unregister(first_conn);
        let _live = fx.connect("agente-2", Role::Operator);

        let members = fx.manager.members_of(&key);
        assert!(members.operator_available);
        assert_eq!(members.operator, Some(ParticipantId::from("agente-2")));
        assert_eq!(
            fx.manager.channel(&key).unwrap().operator,
            Some(ParticipantId::from("agente-2"))
        );
    }

    #[test]
    fn test_members_of_unknown_key_is_empty() {
        let fx = Fixture::new(EscalationSettings::default());
        let members = fx.manager.members_of(&fx.key());
        assert!(members.channel_id.is_none());
        assert!(members.connections.is_empty());
    }

    #[test]
    fn test_close_notifies_members() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let (_, mut op_rx) = fx.connect("agente-c", Role::Operator);
        let (_, mut a_rx) = fx.connect("usuario-a", Role::Primary);
        let key = fx.key();
        let channel = fx
            .manager
            .ensure_open(&key, &ParticipantId::from("usuario-a"))
            .channel;

        fx.manager.close(&key, CloseReason::Operator);

        let expected = ServerEvent::EscalationClosed {
            channel_id: channel.id,
            reason: CloseReason::Operator,
        };
        assert_eq!(op_rx.try_recv().unwrap(), expected);
        assert_eq!(a_rx.try_recv().unwrap(), expected);

        let alerts = fx.sink.alerts.lock().unwrap();
        assert!(matches!(alerts[0], AlertNotice::EscalationOpened { .. }));
        assert!(matches!(alerts[1], AlertNotice::EscalationClosed { .. }));
    }

    #[test]
    fn test_unpaired_participant_gets_solo_key() {
        let fx = Fixture::new(EscalationSettings::default());
        let key = EscalationKey::for_participant(&fx.registry, &ParticipantId::from("usuario-z"));
        assert_eq!(
            key,
            EscalationKey::Solo {
                participant: ParticipantId::from("usuario-z")
            }
        );
        assert!(key.involves(&ParticipantId::from("usuario-z")));
        assert!(key.partner_of(&ParticipantId::from("usuario-z")).is_none());
    }

    #[test]
    fn test_lookup_by_participant_and_operator() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let _live = fx.connect("agente-c", Role::Operator);
        let key = fx.key();
        let channel = fx
            .manager
            .ensure_open(&key, &ParticipantId::from("usuario-a"))
            .channel;

        let by_partner = fx
            .manager
            .open_channel_involving(&ParticipantId::from("usuario-b"))
            .unwrap();
        assert_eq!(by_partner.id, channel.id);

        let by_operator = fx
            .manager
            .open_channel_for_operator(&ParticipantId::from("agente-c"))
            .unwrap();
        assert_eq!(by_operator.id, channel.id);
    }

    #[test]
    fn test_ensure_open_returns_members() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let _live = fx.connect("agente-c", Role::Operator);
        let _a = fx.connect("usuario-a", Role::Primary);
        let key = fx.key();

        let ensured = fx.manager.ensure_open(&key, &ParticipantId::from("usuario-a"));

        assert_eq!(ensured.members.channel_id, Some(ensured.channel.id));
        assert!(ensured.members.operator_available);
        assert_eq!(ensured.members.connections.len(), 2);

        // Closing right after does not change what the caller already holds.
        fx.manager.close(&key, CloseReason::Operator);
        assert!(ensured.members.operator_available);
    }

    #[test]
    fn test_solo_channel_survives_later_pairing() {
        let mut fx = Fixture::new(EscalationSettings::default());
        let _live = fx.connect("agente-c", Role::Operator);
        let d = ParticipantId::from("usuario-d");

        let solo = EscalationKey::for_participant(&fx.registry, &d);
        let channel = fx.manager.ensure_open(&solo, &d).channel;

        fx.registry.pair(Pairing::new("usuario-d", "usuario-e")).unwrap();
        assert_eq!(fx.manager.key_for(&d), solo);

        let closed = fx.manager.close_involving(&d, CloseReason::Operator);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, channel.id);
        assert!(fx.manager.open_channels().is_empty());

        // Nothing open any more: the current pairing decides.
        assert_eq!(
            fx.manager.key_for(&d),
            EscalationKey::Pairing(Pairing::new("usuario-d", "usuario-e"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_channel() {
        let fx = Fixture::new(EscalationSettings {
            preferred_operator: None,
            idle_timeout: Some(Duration::from_secs(60)),
        });
        let key = fx.key();
        fx.manager.ensure_open(&key, &ParticipantId::from("usuario-a"));

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(fx.manager.channel(&key).is_none());
        let history = fx.manager.history(&key);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].close_reason, Some(CloseReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_postpones_idle_timeout() {
        let fx = Fixture::new(EscalationSettings {
            preferred_operator: None,
            idle_timeout: Some(Duration::from_secs(60)),
        });
        let key = fx.key();
        fx.manager.ensure_open(&key, &ParticipantId::from("usuario-a"));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(fx.manager.touch(&key));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(fx.manager.channel(&key).is_some());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(fx.manager.channel(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_close_new_episode() {
        let fx = Fixture::new(EscalationSettings {
            preferred_operator: None,
            idle_timeout: Some(Duration::from_secs(60)),
        });
        let key = fx.key();
        let a = ParticipantId::from("usuario-a");

        fx.manager.ensure_open(&key, &a);
        tokio::time::sleep(Duration::from_secs(30)).await;
        fx.manager.close(&key, CloseReason::Operator);
        let second = fx.manager.ensure_open(&key, &a).channel;

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(fx.manager.channel(&key).map(|c| c.id), Some(second.id));
    }
}
