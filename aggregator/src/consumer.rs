use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use common_kafka::kafka_consumer::{RecvErr, SingleTopicConsumer};
use common_store::error::StoreError;
use common_store::events::Event;
use common_store::summaries::{NewSummary, SummaryKey};

use crate::app_context::AppContext;

// How long a worker blocks on the consumer before re-checking for shutdown
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Fold one event into its hourly bucket. The working set yields the new
/// distinct-user cardinality, the upsert adds one to the stored total and
/// publishes that cardinality.
pub async fn process_event(context: &AppContext, event: Event) -> Result<(), StoreError> {
    let key = SummaryKey::for_event(event.event_type, event.created_at);
    let unique_users = context.working_set.observe(key, event.user_id);

    let summary = NewSummary {
        key,
        total_events: 1,
        unique_users,
        metadata: None,
        updated_at: Utc::now(),
    };
    context.summaries.upsert(&summary).await?;
    Ok(())
}

/// One message loop. Several of these share the consumer; whichever loop
/// polls next takes the next message off the assigned partitions.
pub async fn worker_loop(
    context: Arc<AppContext>,
    consumer: SingleTopicConsumer,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            info!("Shutdown signal received, stopping worker");
            break;
        }
        context.worker_liveness.report_healthy();

        let (event, offset) = match timeout(RECV_TIMEOUT, consumer.json_recv::<Event>()).await {
            Ok(Ok(received)) => received,
            Ok(Err(RecvErr::Empty)) => {
                warn!("Received empty event payload");
                counter!("aggregator_events_dropped_total", "cause" => "empty_payload")
                    .increment(1);
                continue;
            }
            Ok(Err(RecvErr::Serde(e))) => {
                warn!(error = %e, "Received undecodable event payload");
                counter!("aggregator_events_dropped_total", "cause" => "malformed").increment(1);
                continue;
            }
            Ok(Err(RecvErr::Kafka(e))) => {
                error!(error = %e, "Kafka receive failed, will retry");
                counter!("aggregator_recv_errors_total").increment(1);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            // Nothing to read, loop around to re-check for shutdown
            Err(_) => continue,
        };

        match process_event(&context, event).await {
            Ok(()) => {
                counter!("aggregator_events_processed_total").increment(1);
            }
            Err(e) => {
                // Dropped, not retried. The offset is stored either way.
                error!(error = %e, "Failed to fold event into its summary");
                counter!("aggregator_events_dropped_total", "cause" => "upsert_failed")
                    .increment(1);
            }
        }

        if let Err(e) = offset.store() {
            warn!(error = %e, "Failed to store offset");
        }
    }
}
