use async_trait::async_trait;
use common_store::events::Event;
use metrics::{counter, histogram};
use tracing::info;

use crate::api::IngestError;
use crate::sinks::EventSink;

/// Stdout sink for local runs, selected by `PRINT_SINK=true`.
pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn send(&self, event: Event) -> Result<(), IngestError> {
        info!("single event: {:?}", event);
        counter!("ingest_events_published_total").increment(1);

        Ok(())
    }

    async fn send_batch(&self, events: Vec<Event>) -> Vec<Result<(), IngestError>> {
        histogram!("ingest_event_batch_size").record(events.len() as f64);
        counter!("ingest_events_published_total").increment(events.len() as u64);
        for event in &events {
            info!("event: {event:?}");
        }

        events.iter().map(|_| Ok(())).collect()
    }
}
