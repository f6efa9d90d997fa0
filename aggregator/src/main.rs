use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use chrono::Utc;
use futures::future::ready;
use metrics::{counter, gauge};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_metrics::{serve, setup_metrics_routes};

use aggregator::app_context::AppContext;
use aggregator::config::Config;
use aggregator::consumer::worker_loop;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "event aggregation service"
}

fn start_health_liveness_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let bind = format!("{}:{}", config.host, config.port);
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(context.liveness.get_status())),
        );
    let router = setup_metrics_routes(router);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start health server");
    })
}

/// Drops working-set buckets that aged out of the retention window, so the
/// map only ever holds a bounded number of days.
async fn sweep_loop(context: Arc<AppContext>, retention_hours: i64, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;

        let cutoff = (Utc::now() - chrono::Duration::hours(retention_hours)).date_naive();
        let evicted = context.working_set.evict_older_than(cutoff);
        let remaining = context.working_set.tracked_keys();
        if evicted > 0 {
            info!(%cutoff, evicted, remaining, "Evicted aged working-set buckets");
        }
        counter!("aggregator_working_set_evictions_total").increment(evicted as u64);
        gauge!("aggregator_working_set_keys").set(remaining as f64);
        drop(_permit);
    }
}

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting aggregator...");

    let config = Config::init_with_defaults()?;

    let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())?;

    let context = Arc::new(AppContext::new(&config).await?);

    info!(
        topic = config.consumer.kafka_consumer_topic,
        group = config.consumer.kafka_consumer_group,
        workers = config.worker_count,
        "Consumer ready"
    );

    start_health_liveness_server(&config, context.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tokio::spawn(sweep_loop(
        context.clone(),
        config.retention_hours,
        config.eviction_interval_secs,
    ));

    let mut workers = Vec::with_capacity(config.worker_count);
    for _ in 0..config.worker_count {
        workers.push(tokio::spawn(worker_loop(
            context.clone(),
            consumer.clone(),
            shutdown_rx.clone(),
        )));
    }

    let mut shutdown = shutdown_rx;
    shutdown.changed().await?;

    // Workers finish their in-flight message and exit; anything still
    // running after the grace period is dropped with the runtime.
    let drain = futures::future::join_all(workers);
    if tokio::time::timeout(Duration::from_secs(config.shutdown_grace_secs), drain)
        .await
        .is_err()
    {
        warn!(
            grace_secs = config.shutdown_grace_secs,
            "Workers did not drain in time, exiting anyway"
        );
    }

    info!("Aggregator shut down");
    Ok(())
}
