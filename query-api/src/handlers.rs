use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::instrument;
use uuid::Uuid;

use common_store::events::{EventStore, EventType};
use common_store::summaries::SummaryStore;

use crate::api::{HealthResponse, QueryError};
use crate::stats::{
    regroup, Granularity, StatsResponse, TopProductsResponse, UserActivityResponse,
};

const DEFAULT_ACTIVITY_LIMIT: i64 = 100;
const DEFAULT_TOP_PRODUCTS_LIMIT: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub events: EventStore,
    pub summaries: SummaryStore,
}

pub fn add_routes(router: Router<AppState>, events: EventStore, summaries: SummaryStore) -> Router {
    let state = AppState { events, summaries };

    router
        .route("/", get(index))
        .route("/stats", get(get_stats))
        .route("/products/top", get(get_top_products))
        .route("/users/:user_id/activity", get(get_user_activity))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn index() -> &'static str {
    "event query service"
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

/// The shared query-string shape: every endpoint takes a time range, the
/// rest varies. Extra parameters are deserialized where they apply and
/// ignored everywhere else.
#[derive(Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub event_type: Option<String>,
    pub granularity: Option<String>,
    pub limit: Option<i64>,
}

fn parse_timestamp(raw: Option<&str>) -> Result<DateTime<Utc>, QueryError> {
    let raw = raw.ok_or(QueryError::MissingTimeRange)?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| QueryError::InvalidTimestamp(raw.to_string()))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_time_range(query: &RangeQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), QueryError> {
    Ok((
        parse_timestamp(query.from.as_deref())?,
        parse_timestamp(query.to.as_deref())?,
    ))
}

fn parse_event_type(raw: Option<&str>) -> Result<Option<EventType>, QueryError> {
    raw.map(|raw| {
        raw.parse()
            .map_err(|_| QueryError::InvalidEventType(raw.to_string()))
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<StatsResponse>, QueryError> {
    let (from, to) = parse_time_range(&query)?;
    let event_type = parse_event_type(query.event_type.as_deref())?;
    let granularity: Granularity = query
        .granularity
        .as_deref()
        .map(|raw| raw.parse().unwrap_or_default())
        .unwrap_or_default();

    let summaries = state
        .summaries
        .get_range(from.date_naive(), to.date_naive(), event_type)
        .await?;
    let stats = regroup(summaries, granularity);

    Ok(Json(StatsResponse {
        total_count: stats.len() as i64,
        stats,
    }))
}

#[instrument(skip_all)]
pub async fn get_top_products(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<TopProductsResponse>, QueryError> {
    let (from, to) = parse_time_range(&query)?;
    let event_type = parse_event_type(query.event_type.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_TOP_PRODUCTS_LIMIT);

    let products = state
        .events
        .top_products(from, to, limit, event_type)
        .await?;

    Ok(Json(TopProductsResponse { products }))
}

#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn get_user_activity(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<UserActivityResponse>, QueryError> {
    let (from, to) = parse_time_range(&query)?;
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);

    let events = state
        .events
        .get_user_activity(user_id, from, to, limit)
        .await?;

    Ok(Json(UserActivityResponse {
        total_events: events.len() as i64,
        events,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use assert_json_diff::assert_json_eq;
    use chrono::TimeZone;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use sqlx::postgres::PgPool;

    use common_store::events::Event;
    use common_store::summaries::{NewSummary, SummaryKey};

    async fn spawn_app(db: PgPool) -> SocketAddr {
        let app = add_routes(
            Router::new(),
            EventStore::new(db.clone()),
            SummaryStore::new(db),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().expect("failed to read local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server crashed");
        });
        addr
    }

    async fn seed_summary(db: &PgPool, hour: i32, event_type: EventType, total: i64, uniques: i64) {
        let store = SummaryStore::new(db.clone());
        store
            .upsert(&NewSummary {
                key: SummaryKey {
                    date: chrono::NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
                    hour,
                    event_type,
                },
                total_events: total,
                unique_users: uniques,
                metadata: None,
                updated_at: Utc::now(),
            })
            .await
            .expect("failed to seed summary");
    }

    fn event_at(event_type: EventType, user_id: Uuid, hour: u32, minute: u32) -> Event {
        Event {
            id: Uuid::now_v7(),
            event_type,
            user_id,
            session_id: Uuid::now_v7(),
            product_id: None,
            payload: sqlx::types::Json(HashMap::new()),
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap(),
            processed_at: None,
        }
    }

    const FROM: &str = "2024-03-05T00:00:00Z";
    const TO: &str = "2024-03-05T23:59:59Z";

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn stats_default_to_hourly_buckets(db: PgPool) {
        seed_summary(&db, 9, EventType::PageView, 7, 3).await;
        seed_summary(&db, 9, EventType::Search, 1, 1).await;
        seed_summary(&db, 11, EventType::PageView, 4, 2).await;
        let addr = spawn_app(db).await;

        let res = reqwest::get(format!("http://{addr}/stats?from={FROM}&to={TO}"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: Value = res.json().await.unwrap();
        assert_json_eq!(
            body,
            json!({
                "stats": [
                    {"timestamp": "2024-03-05T09:00:00Z", "event_type": "page_view",
                     "total_events": 7, "unique_users": 3},
                    {"timestamp": "2024-03-05T09:00:00Z", "event_type": "search",
                     "total_events": 1, "unique_users": 1},
                    {"timestamp": "2024-03-05T11:00:00Z", "event_type": "page_view",
                     "total_events": 4, "unique_users": 2},
                ],
                "total_count": 3,
            })
        );
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn day_granularity_folds_hours_together(db: PgPool) {
        for hour in [9, 10, 11] {
            seed_summary(&db, hour, EventType::PageView, 1, 1).await;
        }
        let addr = spawn_app(db).await;

        let url = format!("http://{addr}/stats?from={FROM}&to={TO}&granularity=day");
        let body: StatsResponse = reqwest::get(url).await.unwrap().json().await.unwrap();

        assert_eq!(body.total_count, 1);
        assert_eq!(body.stats.len(), 1);
        assert_eq!(
            body.stats[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
        );
        assert_eq!(body.stats[0].total_events, 3);
        assert_eq!(body.stats[0].unique_users, 1);
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn stats_filter_by_event_type(db: PgPool) {
        seed_summary(&db, 9, EventType::PageView, 7, 3).await;
        seed_summary(&db, 9, EventType::Purchase, 2, 2).await;
        let addr = spawn_app(db).await;

        let url = format!("http://{addr}/stats?from={FROM}&to={TO}&event_type=purchase");
        let body: StatsResponse = reqwest::get(url).await.unwrap().json().await.unwrap();

        assert_eq!(body.total_count, 1);
        assert_eq!(body.stats[0].event_type, EventType::Purchase);
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn unknown_granularity_falls_back_to_hourly(db: PgPool) {
        seed_summary(&db, 9, EventType::PageView, 1, 1).await;
        seed_summary(&db, 10, EventType::PageView, 1, 1).await;
        let addr = spawn_app(db).await;

        let url = format!("http://{addr}/stats?from={FROM}&to={TO}&granularity=fortnight");
        let res = reqwest::get(url).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: StatsResponse = res.json().await.unwrap();
        assert_eq!(body.total_count, 2);
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn stats_require_a_complete_time_range(db: PgPool) {
        let addr = spawn_app(db).await;

        for url in [
            format!("http://{addr}/stats"),
            format!("http://{addr}/stats?from={FROM}"),
            format!("http://{addr}/stats?to={TO}"),
            format!("http://{addr}/stats?from=yesterday&to={TO}"),
        ] {
            let res = reqwest::get(url).await.unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn stats_reject_unknown_event_types(db: PgPool) {
        let addr = spawn_app(db).await;

        let url = format!("http://{addr}/stats?from={FROM}&to={TO}&event_type=checkout");
        let res = reqwest::get(url).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            res.text().await.unwrap(),
            "checkout is not a known event type"
        );
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn top_products_rank_by_volume_within_the_range(db: PgPool) {
        let store = EventStore::new(db.clone());
        let product_a = Uuid::now_v7();
        let product_b = Uuid::now_v7();
        let (alice, bob) = (Uuid::now_v7(), Uuid::now_v7());

        let mut seed = vec![
            event_at(EventType::ProductView, alice, 9, 0),
            event_at(EventType::ProductView, bob, 9, 5),
            event_at(EventType::Purchase, alice, 9, 10),
        ];
        for event in &mut seed {
            event.product_id = Some(product_a);
        }
        let mut other = event_at(EventType::ProductView, alice, 9, 20);
        other.product_id = Some(product_b);
        seed.push(other);
        store.create_batch(&seed).await.unwrap();

        let addr = spawn_app(db).await;

        let url = format!("http://{addr}/products/top?from={FROM}&to={TO}");
        let body: Value = reqwest::get(url).await.unwrap().json().await.unwrap();
        assert_json_eq!(
            body,
            json!({
                "products": [
                    {"product_id": product_a, "total_events": 3,
                     "unique_users": 2, "conversion_rate": 0.0},
                    {"product_id": product_b, "total_events": 1,
                     "unique_users": 1, "conversion_rate": 0.0},
                ],
            })
        );

        let url = format!("http://{addr}/products/top?from={FROM}&to={TO}&limit=1");
        let body: Value = reqwest::get(url).await.unwrap().json().await.unwrap();
        assert_eq!(body["products"].as_array().unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn user_activity_lists_own_events_newest_first(db: PgPool) {
        let store = EventStore::new(db.clone());
        let user = Uuid::now_v7();
        let other = Uuid::now_v7();

        let early = event_at(EventType::PageView, user, 9, 0);
        let late = event_at(EventType::Purchase, user, 11, 0);
        store.create(&early).await.unwrap();
        store.create(&late).await.unwrap();
        store
            .create(&event_at(EventType::PageView, other, 10, 0))
            .await
            .unwrap();

        let addr = spawn_app(db).await;

        let url = format!("http://{addr}/users/{user}/activity?from={FROM}&to={TO}");
        let body: UserActivityResponse = reqwest::get(url).await.unwrap().json().await.unwrap();

        assert_eq!(body.total_events, 2);
        assert_eq!(body.events[0].id, late.id);
        assert_eq!(body.events[1].id, early.id);

        let url = format!("http://{addr}/users/{user}/activity?from={FROM}&to={TO}&limit=1");
        let body: UserActivityResponse = reqwest::get(url).await.unwrap().json().await.unwrap();
        assert_eq!(body.total_events, 1);
        assert_eq!(body.events[0].id, late.id);
    }

    #[sqlx::test(migrations = "../common/store/migrations")]
    async fn index_and_health_respond(db: PgPool) {
        let addr = spawn_app(db).await;

        let res = reqwest::get(format!("http://{addr}/")).await.unwrap();
        assert_eq!(res.text().await.unwrap(), "event query service");

        let res = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        assert_json_eq!(
            body,
            json!({
                "status": "healthy",
                "dependencies": {"database": "healthy"},
            })
        );
    }
}
