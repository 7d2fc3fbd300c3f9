use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use intercom_protocol::ErrorCode;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Why a single send to a connection did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The transport side of the connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection's outbound buffer is full.
    #[error("connection buffer full")]
    Backpressure,
}

/// Errors produced by the relay core.
///
/// None of these abort a routing call: per-destination problems are
/// collected into the routing outcome, ingress problems are returned to
/// the transport before anything is routed.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Recipient not currently connected.
    #[error("Unknown destination: {0} is not connected")]
    UnknownDestination(String),

    /// A pairing claim collides with an existing pairing.
    #[error(
        "Duplicate role conflict: {participant} cannot pair with {partner}, existing pairing {existing}"
    )]
    DuplicateRoleConflict {
        participant: String,
        partner: String,
        existing: String,
    },

    /// An escalation fired while no operator was connected.
    #[error("No operator available for escalation {channel_id} raised by {raised_by}")]
    NoOperatorAvailable { channel_id: Uuid, raised_by: String },

    /// Inbound frame missing required fields or not parseable.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The connection sent a message before registering.
    #[error("Connection is not registered")]
    NotRegistered,

    /// The sender's role does not allow the requested action.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A send to one destination failed.
    #[error("Delivery to {participant} failed: {source}")]
    Delivery {
        participant: String,
        #[source]
        source: DeliveryError,
    },
}

impl RelayError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Wire error code reported to the offending connection.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownDestination(_) => ErrorCode::UnknownDestination,
            Self::DuplicateRoleConflict { .. } => ErrorCode::DuplicateRoleConflict,
            Self::NoOperatorAvailable { .. } => ErrorCode::NoOperatorAvailable,
            Self::MalformedMessage(_) => ErrorCode::MalformedMessage,
            Self::NotRegistered => ErrorCode::NotRegistered,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Delivery { .. } => ErrorCode::Internal,
        }
    }
}

/// HTTP error type for the inspection endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };

        (status, Json(body)).into_response()
    }
}
