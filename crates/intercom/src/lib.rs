//! Escalation-aware message relay.
//!
//! Connects a primary user with their paired companion and silently copies
//! alerting messages to an on-duty emergency operator.

pub mod audit;
pub mod config;
pub mod error;
pub mod escalation;
pub mod message;
pub mod policy;
pub mod registry;
pub mod relay;
pub mod router;
pub mod routes;
pub mod stats;
pub mod ws;

use std::sync::Arc;

pub use crate::config::RelayConfig;
pub use crate::relay::Relay;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(relay: Relay, config: RelayConfig) -> Self {
        Self {
            relay: Arc::new(relay),
            config: Arc::new(config),
        }
    }
}
