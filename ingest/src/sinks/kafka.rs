use async_trait::async_trait;
use chrono::Utc;
use common_kafka::kafka_producer::KafkaContext;
use common_store::events::Event;
use metrics::{counter, histogram};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use tracing::log::error;
use tracing::{info_span, instrument, Instrument};

use crate::api::IngestError;
use crate::sinks::EventSink;

/// Publishes events onto the raw-events topic, keyed by `user_id` so that
/// one user's events stay on one partition.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> KafkaSink {
        KafkaSink { producer, topic }
    }

    async fn kafka_send(&self, event: &Event) -> Result<DeliveryFuture, IngestError> {
        let payload = serde_json::to_string(event).map_err(|e| {
            error!("failed to serialize event: {}", e);
            IngestError::NonRetryableSinkError
        })?;

        let key = event.user_id.to_string();
        let sent_at = Utc::now().to_rfc3339();

        match self.producer.send_result(FutureRecord {
            topic: &self.topic,
            payload: Some(&payload),
            partition: None,
            key: Some(&key),
            timestamp: None,
            headers: Some(OwnedHeaders::new().insert(Header {
                key: "timestamp",
                value: Some(&sent_at),
            })),
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    counter!("ingest_events_dropped_total", "cause" => "kafka_message_size")
                        .increment(1);
                    Err(IngestError::EventTooBig)
                }
                _ => {
                    counter!("ingest_events_dropped_total", "cause" => "kafka_write_error")
                        .increment(1);
                    error!("failed to produce event: {}", e);
                    Err(IngestError::RetryableSinkError)
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), IngestError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(IngestError::RetryableSinkError)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                counter!("ingest_events_dropped_total", "cause" => "kafka_message_size")
                    .increment(1);
                Err(IngestError::EventTooBig)
            }
            Ok(Err((err, _))) => {
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(IngestError::RetryableSinkError)
            }
            Ok(Ok(_)) => {
                counter!("ingest_events_published_total").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    #[instrument(skip_all)]
    async fn send(&self, event: Event) -> Result<(), IngestError> {
        let ack = self.kafka_send(&event).await?;
        histogram!("ingest_event_batch_size").record(1.0);
        Self::process_ack(ack)
            .instrument(info_span!("ack_wait_one"))
            .await
    }

    #[instrument(skip_all)]
    async fn send_batch(&self, events: Vec<Event>) -> Vec<Result<(), IngestError>> {
        // Sequential enqueue keeps the producer queue in submission order,
        // the broker ACKs are then awaited together.
        let mut acks = Vec::with_capacity(events.len());
        for event in &events {
            acks.push(self.kafka_send(event).await);
        }

        histogram!("ingest_event_batch_size").record(acks.len() as f64);

        async move {
            let mut results = Vec::with_capacity(acks.len());
            for ack in acks {
                results.push(match ack {
                    Ok(ack) => Self::process_ack(ack).await,
                    Err(err) => Err(err),
                });
            }
            results
        }
        .instrument(info_span!("ack_wait_many"))
        .await
    }
}
