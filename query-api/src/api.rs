use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DependencyReport {
    pub database: String,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub dependencies: DependencyReport,
}

impl HealthResponse {
    /// Dependency statuses are reported as healthy without probing; a broken
    /// pool surfaces as 503s on the query endpoints themselves.
    pub fn healthy() -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            dependencies: DependencyReport {
                database: "healthy".to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("from and to are required RFC 3339 timestamps")]
    MissingTimeRange,
    #[error("{0} is not a valid RFC 3339 timestamp")]
    InvalidTimestamp(String),
    #[error("{0} is not a known event type")]
    InvalidEventType(String),

    #[error("stats storage unavailable")]
    StoreUnavailable,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        match self {
            QueryError::MissingTimeRange
            | QueryError::InvalidTimestamp(_)
            | QueryError::InvalidEventType(_) => (StatusCode::BAD_REQUEST, self.to_string()),

            QueryError::StoreUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

impl From<StoreError> for QueryError {
    fn from(_: StoreError) -> Self {
        QueryError::StoreUnavailable
    }
}
