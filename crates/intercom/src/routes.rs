//! HTTP routes: the WebSocket endpoint plus read-only inspection.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::error::ApiError;
use crate::escalation::{EscalationChannel, EscalationKey};
use crate::message::ParticipantId;
use crate::registry::ParticipantSummary;
use crate::stats::StatsSnapshot;
use crate::ws;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/participants", get(participants))
        .route("/escalations", get(open_escalations))
        .route("/escalations/{participant_id}", get(escalation_for))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connected: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connected: state.relay.registry().connected_count(),
    })
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.relay.stats())
}

/// GET /participants
pub async fn participants(State(state): State<AppState>) -> Json<Vec<ParticipantSummary>> {
    Json(state.relay.registry().summaries())
}

/// GET /escalations
pub async fn open_escalations(State(state): State<AppState>) -> Json<Vec<EscalationChannel>> {
    Json(state.relay.escalations().open_channels())
}

#[derive(Debug, Serialize)]
pub struct EscalationView {
    pub key: EscalationKey,
    pub open: Option<EscalationChannel>,
    pub history: Vec<EscalationChannel>,
}

/// GET /escalations/{participant_id}
pub async fn escalation_for(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> Result<Json<EscalationView>, ApiError> {
    let participant = ParticipantId::from(participant_id);
    let registry = state.relay.registry();
    if registry.participant(&participant).is_none() && registry.pairing_of(&participant).is_none() {
        return Err(ApiError::NotFound(format!("participant {participant}")));
    }

    let escalations = state.relay.escalations();
    let key = escalations.key_for(&participant);
    Ok(Json(EscalationView {
        open: escalations.channel(&key),
        history: escalations.history(&key),
        key,
    }))
}
