//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters plus the active connection gauge.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub(crate) messages_routed: AtomicU64,
    pub(crate) messages_alerted: AtomicU64,
    pub(crate) deliveries_succeeded: AtomicU64,
    pub(crate) deliveries_failed: AtomicU64,
    pub(crate) unknown_destination: AtomicU64,
    pub(crate) no_operator_available: AtomicU64,
    pub(crate) malformed_rejected: AtomicU64,
    pub(crate) escalations_opened: AtomicU64,
    pub(crate) escalations_closed: AtomicU64,
    pub(crate) connections_active: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_routed: u64,
    pub messages_alerted: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub unknown_destination: u64,
    pub no_operator_available: u64,
    pub malformed_rejected: u64,
    pub escalations_opened: u64,
    pub escalations_closed: u64,
    pub connections_active: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        bump(&self.connections_active);
    }

    pub(crate) fn connection_closed(&self) {
        // Saturating: a double close must not wrap the gauge.
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_routed: load(&self.messages_routed),
            messages_alerted: load(&self.messages_alerted),
            deliveries_succeeded: load(&self.deliveries_succeeded),
            deliveries_failed: load(&self.deliveries_failed),
            unknown_destination: load(&self.unknown_destination),
            no_operator_available: load(&self.no_operator_available),
            malformed_rejected: load(&self.malformed_rejected),
            escalations_opened: load(&self.escalations_opened),
            escalations_closed: load(&self.escalations_closed),
            connections_active: load(&self.connections_active),
        }
    }
}
