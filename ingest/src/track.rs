use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use common_store::events::{CreateResult, Event};
use metrics::counter;
use serde::Deserialize;
use tracing::instrument;
use tracing::log::{debug, warn};
use uuid::Uuid;

use crate::api::{BatchTrackResponse, HealthResponse, IngestError, TrackResponse};
use crate::event::RawEvent;
use crate::router;

#[instrument(skip_all, fields(event_id))]
pub async fn track_event(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<TrackResponse>, IngestError> {
    let raw = RawEvent::from_bytes(&body)?;
    let event = raw.process(state.timesource.now())?;
    tracing::Span::current().record("event_id", event.id.to_string());

    counter!("ingest_events_received_total").increment(1);

    let created = state.store.create(&event).await?;

    // Persistence is the durability contract, publication is best effort.
    if let Err(err) = state.sink.send(event.clone()).await {
        counter!("ingest_publish_failures_total").increment(1);
        warn!("failed to publish event {}: {}", event.id, err);
    }

    let message = match created {
        CreateResult::Inserted => "event tracked successfully",
        CreateResult::AlreadyTracked => "event already tracked",
    };

    Ok(Json(TrackResponse {
        id: event.id,
        message: message.to_string(),
        success: true,
    }))
}

#[instrument(skip_all, fields(batch_size))]
pub async fn track_batch(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<BatchTrackResponse>, IngestError> {
    let raw_events = RawEvent::batch_from_bytes(&body)?;
    tracing::Span::current().record("batch_size", raw_events.len());

    if raw_events.is_empty() {
        return Err(IngestError::EmptyBatch);
    }

    let submitted = raw_events.len();
    counter!("ingest_events_received_total").increment(submitted as u64);

    let now = state.timesource.now();
    let mut failed_ids = Vec::new();
    let mut events: Vec<Event> = Vec::with_capacity(submitted);
    for raw in raw_events {
        let submitted_id = raw.submitted_id();
        match raw.process(now) {
            Ok(event) => events.push(event),
            Err(err) => {
                counter!("ingest_events_dropped_total", "cause" => "invalid_event").increment(1);
                warn!("dropping invalid event from batch: {}", err);
                failed_ids.push(submitted_id);
            }
        }
    }

    if !events.is_empty() {
        let inserted = state.store.create_batch(&events).await?;
        debug!(
            "persisted {} of {} submitted events, duplicates skipped",
            inserted, submitted
        );

        let outcomes = state.sink.send_batch(events.clone()).await;
        for (event, outcome) in events.iter().zip(outcomes) {
            if let Err(err) = outcome {
                counter!("ingest_publish_failures_total").increment(1);
                warn!("failed to publish event {}: {}", event.id, err);
                failed_ids.push(event.id.to_string());
            }
        }
    }

    Ok(Json(BatchTrackResponse {
        processed_count: (submitted - failed_ids.len()) as u64,
        failed_ids,
    }))
}

#[instrument(skip_all, fields(event_id = %event_id))]
pub async fn get_event(
    state: State<router::State>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<Event>, IngestError> {
    let event = state.store.get(event_id).await?;
    Ok(Json(event))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn get_user_events(
    state: State<router::State>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Event>>, IngestError> {
    let events = state
        .store
        .get_by_user(user_id, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(events))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
