use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Response to `POST /events`. Duplicate submissions still succeed, the
/// message distinguishes them for callers that care.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrackResponse {
    pub id: Uuid,
    pub message: String,
    pub success: bool,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchTrackResponse {
    pub processed_count: u64,
    pub failed_ids: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DependencyReport {
    pub database: String,
    pub kafka: String,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub dependencies: DependencyReport,
}

impl HealthResponse {
    /// Dependency statuses are reported as healthy without probing; liveness
    /// of the producer loop is tracked separately on `/_liveness`.
    pub fn healthy() -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            dependencies: DependencyReport {
                database: "healthy".to_string(),
                kafka: "healthy".to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("request holds no event")]
    EmptyBatch,
    #[error("event submitted with an empty event type")]
    MissingEventType,
    #[error("{0} is not a known event type")]
    InvalidEventType(String),
    #[error("event submitted without a valid user_id")]
    MissingUserId,
    #[error("event submitted without a valid session_id")]
    MissingSessionId,
    #[error("{0} is not a valid product_id")]
    InvalidProductId(String),
    #[error("{0} is not a valid RFC 3339 timestamp")]
    InvalidTimestamp(String),

    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("maximum event size exceeded")]
    EventTooBig,
    #[error("invalid event could not be processed")]
    NonRetryableSinkError,
    #[error("event storage unavailable")]
    StoreUnavailable,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::RequestParsingError(_)
            | IngestError::EmptyBatch
            | IngestError::MissingEventType
            | IngestError::InvalidEventType(_)
            | IngestError::MissingUserId
            | IngestError::MissingSessionId
            | IngestError::InvalidProductId(_)
            | IngestError::InvalidTimestamp(_)
            | IngestError::EventTooBig
            | IngestError::NonRetryableSinkError => (StatusCode::BAD_REQUEST, self.to_string()),

            IngestError::EventNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),

            IngestError::RetryableSinkError | IngestError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
        .into_response()
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EventNotFound(id) => IngestError::EventNotFound(id),
            _ => IngestError::StoreUnavailable,
        }
    }
}
