use std::collections::HashMap;
use std::str::FromStr;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use common_store::events::{Event, EventType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::IngestError;

/// Wire-format event, everything optional or stringly typed so that one
/// malformed element never takes down the rest of a batch. Validation
/// happens in [`RawEvent::process`], per event.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RawEvent {
    pub fn from_bytes(bytes: &Bytes) -> Result<RawEvent, IngestError> {
        tracing::debug!(len = bytes.len(), "decoding new event");
        Ok(serde_json::from_slice::<RawEvent>(bytes)?)
    }

    pub fn batch_from_bytes(bytes: &Bytes) -> Result<Vec<RawEvent>, IngestError> {
        tracing::debug!(len = bytes.len(), "decoding event batch");
        Ok(serde_json::from_slice::<Vec<RawEvent>>(bytes)?)
    }

    /// The id string as the caller sent it, echoed back in `failed_ids` when
    /// the event never makes it far enough to get a canonical id.
    pub fn submitted_id(&self) -> String {
        self.id.clone().unwrap_or_default()
    }

    /// Validates the wire event and lifts it into a storable [`Event`].
    /// A missing or unparseable id is replaced, not rejected; everything
    /// else invalid is an error. `default_created_at` is the server clock,
    /// used when the caller does not date the event.
    pub fn process(self, default_created_at: DateTime<Utc>) -> Result<Event, IngestError> {
        let id = self
            .id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::now_v7);

        if self.event_type.is_empty() {
            return Err(IngestError::MissingEventType);
        }
        let event_type = EventType::from_str(&self.event_type)
            .map_err(|_| IngestError::InvalidEventType(self.event_type.clone()))?;

        let user_id = parse_required_uuid(&self.user_id).ok_or(IngestError::MissingUserId)?;
        let session_id =
            parse_required_uuid(&self.session_id).ok_or(IngestError::MissingSessionId)?;

        let product_id = match self.product_id.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                Uuid::parse_str(raw).map_err(|_| IngestError::InvalidProductId(raw.to_string()))?,
            ),
        };

        let created_at = match self.created_at.as_deref() {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|_| IngestError::InvalidTimestamp(raw.to_string()))?
                .with_timezone(&Utc),
            None => default_created_at,
        };

        Ok(Event {
            id,
            event_type,
            user_id,
            session_id,
            product_id,
            payload: sqlx::types::Json(self.payload),
            created_at,
            processed_at: None,
        })
    }
}

fn parse_required_uuid(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok().filter(|id| !id.is_nil())
}
