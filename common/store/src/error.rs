use thiserror::Error;
use uuid::Uuid;

/// Enumeration of errors for operations against the event and summary stores.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("event {0} not found")]
    EventNotFound(Uuid),
    #[error("event {0} was already processed")]
    AlreadyProcessed(Uuid),
    #[error("{0} is not a valid EventType")]
    ParseEventTypeError(String),
}
