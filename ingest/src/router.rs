use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use common_store::events::EventStore;
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use crate::{sinks::EventSink, time::TimeSource, track};

use common_metrics::{setup_metrics_recorder, track_metrics};

#[derive(Clone)]
pub struct State {
    pub store: EventStore,
    pub sink: Arc<dyn EventSink + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
}

async fn index() -> &'static str {
    "event ingestion service"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static, S: EventSink + Send + Sync + 'static>(
    timesource: TZ,
    store: EventStore,
    sink: S,
    liveness: HealthRegistry,
    metrics: bool,
) -> Router {
    let state = State {
        store,
        sink: Arc::new(sink),
        timesource: Arc::new(timesource),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/events", post(track::track_event))
        .route("/events/batch", post(track::track_batch))
        .route("/events/:event_id", get(track::get_event))
        .route("/users/:user_id/events", get(track::get_user_events))
        .route("/health", get(track::health))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
