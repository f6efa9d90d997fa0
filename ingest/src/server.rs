use std::future::Future;
use std::net::SocketAddr;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use common_kafka::kafka_producer::create_kafka_producer;
use common_store::events::EventStore;
use health::HealthRegistry;

use crate::config::Config;
use crate::router;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");
    let store = EventStore::new(pool);

    let liveness = HealthRegistry::new("liveness");

    let app = if config.print_sink {
        router::router(
            crate::time::SystemTime {},
            store,
            PrintSink {},
            liveness,
            config.export_prometheus,
        )
    } else {
        let handle = liveness.register("rdkafka".to_string(), time::Duration::seconds(30));
        let producer = create_kafka_producer(&config.kafka, handle)
            .await
            .expect("failed to start Kafka producer");
        let sink = KafkaSink::new(producer, config.kafka_topic.clone());
        router::router(
            crate::time::SystemTime {},
            store,
            sink,
            liveness,
            config.export_prometheus,
        )
    };

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .unwrap()
}
