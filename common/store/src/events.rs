use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

/// The closed set of behavior events the pipeline understands.
/// Stored as snake_case VARCHAR, and spelled the same way on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
pub enum EventType {
    PageView,
    ProductView,
    AddToCart,
    RemoveFromCart,
    Purchase,
    Search,
}

impl FromStr for EventType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page_view" => Ok(EventType::PageView),
            "product_view" => Ok(EventType::ProductView),
            "add_to_cart" => Ok(EventType::AddToCart),
            "remove_from_cart" => Ok(EventType::RemoveFromCart),
            "purchase" => Ok(EventType::Purchase),
            "search" => Ok(EventType::Search),
            invalid => Err(StoreError::ParseEventTypeError(invalid.to_owned())),
        }
    }
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::ProductView => "product_view",
            EventType::AddToCart => "add_to_cart",
            EventType::RemoveFromCart => "remove_from_cart",
            EventType::Purchase => "purchase",
            EventType::Search => "search",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked user-behavior event. Immutable once written, except for the
/// `processed_at` stamp applied through `mark_processed`.
///
/// This is also the message value republished to Kafka, so the serde shape
/// is part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub product_id: Option<Uuid>,
    pub payload: sqlx::types::Json<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of a single-event insert: duplicates are not errors, the row
/// simply already exists.
#[derive(Debug, PartialEq, Eq)]
pub enum CreateResult {
    Inserted,
    AlreadyTracked,
}

/// Per-product rollup computed over raw events.
#[derive(Debug, Clone, Serialize)]
pub struct ProductStats {
    pub product_id: Uuid,
    pub total_events: i64,
    pub unique_users: i64,
    pub conversion_rate: f64,
}

const INSERT_EVENT: &str = r#"
INSERT INTO events (id, event_type, user_id, session_id, product_id, payload, created_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (id) DO NOTHING
"#;

fn bind_event<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    event: &'q Event,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(event.id)
        .bind(event.event_type)
        .bind(event.user_id)
        .bind(event.session_id)
        .bind(event.product_id)
        .bind(&event.payload)
        .bind(event.created_at)
}

/// Persistence for raw events, implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one event. Inserting an id that already exists is a no-op
    /// reported as `CreateResult::AlreadyTracked`.
    pub async fn create(&self, event: &Event) -> Result<CreateResult, StoreError> {
        let result = bind_event(sqlx::query(INSERT_EVENT), event)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            Ok(CreateResult::AlreadyTracked)
        } else {
            Ok(CreateResult::Inserted)
        }
    }

    /// Insert a batch of events in one transaction, skipping duplicates
    /// row by row. Returns how many rows were actually inserted. Any
    /// failure other than a duplicate rolls the whole batch back.
    pub async fn create_batch(&self, events: &[Event]) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let mut inserted = 0;
        for event in events {
            let result = bind_event(sqlx::query(INSERT_EVENT), event)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(inserted)
    }

    pub async fn get(&self, id: Uuid) -> Result<Event, StoreError> {
        sqlx::query_as::<_, Event>(
            r#"
SELECT id, event_type, user_id, session_id, product_id, payload, created_at, processed_at
FROM events
WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?
        .ok_or(StoreError::EventNotFound(id))
    }

    /// A user's events, newest first.
    pub async fn get_by_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<Event>, StoreError> {
        sqlx::query_as::<_, Event>(
            r#"
SELECT id, event_type, user_id, session_id, product_id, payload, created_at, processed_at
FROM events
WHERE user_id = $1
ORDER BY created_at DESC
LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// A user's events within a time range, newest first.
    pub async fn get_user_activity(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        sqlx::query_as::<_, Event>(
            r#"
SELECT id, event_type, user_id, session_id, product_id, payload, created_at, processed_at
FROM events
WHERE user_id = $1
  AND created_at >= $2
  AND created_at <= $3
ORDER BY created_at DESC
LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Rank products by event volume over raw events within a time range.
    /// Events without a product are not counted. The conversion rate is a
    /// placeholder until the read model grows a purchase-to-view ratio.
    pub async fn top_products(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
        event_type: Option<EventType>,
    ) -> Result<Vec<ProductStats>, StoreError> {
        let mut query = String::from(
            r#"
SELECT product_id, COUNT(*) AS total_events, COUNT(DISTINCT user_id) AS unique_users
FROM events
WHERE product_id IS NOT NULL
  AND created_at >= $1
  AND created_at <= $2
            "#,
        );
        if event_type.is_some() {
            query.push_str(" AND event_type = $4");
        }
        query.push_str(" GROUP BY product_id ORDER BY total_events DESC LIMIT $3");

        let mut rows = sqlx::query_as::<_, (Uuid, i64, i64)>(&query)
            .bind(from)
            .bind(to)
            .bind(limit);
        if let Some(event_type) = event_type {
            rows = rows.bind(event_type);
        }

        let rows = rows
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows
            .into_iter()
            .map(|(product_id, total_events, unique_users)| ProductStats {
                product_id,
                total_events,
                unique_users,
                conversion_rate: 0.0,
            })
            .collect())
    }

    /// Stamp an event as processed. Events are only ever stamped once;
    /// a second call reports `AlreadyProcessed`.
    pub async fn mark_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE events
SET processed_at = NOW()
WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyProcessed(id));
        }

        Ok(())
    }

    /// Unprocessed events, oldest first.
    pub async fn get_unprocessed(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        sqlx::query_as::<_, Event>(
            r#"
SELECT id, event_type, user_id, session_id, product_id, payload, created_at, processed_at
FROM events
WHERE processed_at IS NULL
ORDER BY created_at ASC
LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_at(event_type: EventType, user_id: Uuid, created_at: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::now_v7(),
            event_type,
            user_id,
            session_id: Uuid::now_v7(),
            product_id: None,
            payload: sqlx::types::Json(HashMap::new()),
            created_at,
            processed_at: None,
        }
    }

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap()
    }

    #[test]
    fn event_type_round_trips_through_str() {
        for (s, t) in [
            ("page_view", EventType::PageView),
            ("product_view", EventType::ProductView),
            ("add_to_cart", EventType::AddToCart),
            ("remove_from_cart", EventType::RemoveFromCart),
            ("purchase", EventType::Purchase),
            ("search", EventType::Search),
        ] {
            assert_eq!(EventType::from_str(s).unwrap(), t);
            assert_eq!(t.to_string(), s);
        }
        assert!(EventType::from_str("").is_err());
        assert!(EventType::from_str("checkout").is_err());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn create_is_idempotent(db: PgPool) {
        let store = EventStore::new(db.clone());
        let mut event = event_at(EventType::PageView, Uuid::now_v7(), ts(9, 0));
        event
            .payload
            .insert("page".to_string(), "/checkout".to_string());

        assert_eq!(store.create(&event).await.unwrap(), CreateResult::Inserted);
        assert_eq!(
            store.create(&event).await.unwrap(),
            CreateResult::AlreadyTracked
        );

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let found = store.get(event.id).await.unwrap();
        assert_eq!(found.event_type, EventType::PageView);
        assert_eq!(found.user_id, event.user_id);
        assert_eq!(found.session_id, event.session_id);
        assert_eq!(found.product_id, None);
        assert_eq!(found.payload.get("page"), Some(&"/checkout".to_string()));
        assert_eq!(found.processed_at, None);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn create_batch_skips_duplicates(db: PgPool) {
        let store = EventStore::new(db.clone());
        let user = Uuid::now_v7();
        let first = event_at(EventType::Search, user, ts(10, 0));
        store.create(&first).await.unwrap();

        let batch = vec![
            first.clone(),
            event_at(EventType::PageView, user, ts(10, 1)),
            event_at(EventType::Purchase, user, ts(10, 2)),
        ];
        let inserted = store.create_batch(&batch).await.unwrap();
        assert_eq!(inserted, 2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_reports_missing_events(db: PgPool) {
        let store = EventStore::new(db);
        let id = Uuid::now_v7();
        match store.get(id).await {
            Err(StoreError::EventNotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected EventNotFound, got {other:?}"),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_by_user_returns_newest_first(db: PgPool) {
        let store = EventStore::new(db);
        let user = Uuid::now_v7();
        let other = Uuid::now_v7();

        let early = event_at(EventType::PageView, user, ts(8, 0));
        let late = event_at(EventType::Purchase, user, ts(11, 0));
        let middle = event_at(EventType::Search, user, ts(9, 30));
        for event in [&early, &late, &middle] {
            store.create(event).await.unwrap();
        }
        store
            .create(&event_at(EventType::PageView, other, ts(10, 0)))
            .await
            .unwrap();

        let events = store.get_by_user(user, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, late.id);
        assert_eq!(events[1].id, middle.id);

        let activity = store
            .get_user_activity(user, ts(8, 30), ts(10, 0), 100)
            .await
            .unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].id, middle.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn mark_processed_stamps_once(db: PgPool) {
        let store = EventStore::new(db);
        let event = event_at(EventType::AddToCart, Uuid::now_v7(), ts(9, 0));
        store.create(&event).await.unwrap();

        store.mark_processed(event.id).await.unwrap();
        match store.mark_processed(event.id).await {
            Err(StoreError::AlreadyProcessed(id)) => assert_eq!(id, event.id),
            other => panic!("expected AlreadyProcessed, got {other:?}"),
        }

        let unprocessed = store.get_unprocessed(10).await.unwrap();
        assert!(unprocessed.is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn top_products_ranks_by_volume(db: PgPool) {
        let store = EventStore::new(db);
        let product_a = Uuid::now_v7();
        let product_b = Uuid::now_v7();
        let (u1, u2, u3) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        let mut seed = vec![
            event_at(EventType::ProductView, u1, ts(9, 0)),
            event_at(EventType::ProductView, u2, ts(9, 5)),
            event_at(EventType::Purchase, u1, ts(9, 10)),
        ];
        for event in &mut seed {
            event.product_id = Some(product_a);
        }
        let mut b_view = event_at(EventType::ProductView, u3, ts(9, 20));
        b_view.product_id = Some(product_b);
        seed.push(b_view);
        // No product id, never ranked
        seed.push(event_at(EventType::Search, u1, ts(9, 30)));
        // Outside of the queried range
        let mut stale = event_at(EventType::ProductView, u2, ts(20, 0));
        stale.product_id = Some(product_a);
        seed.push(stale);

        store.create_batch(&seed).await.unwrap();

        let top = store
            .top_products(ts(8, 0), ts(10, 0), 10, None)
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].product_id, product_a);
        assert_eq!(top[0].total_events, 3);
        assert_eq!(top[0].unique_users, 2);
        assert_eq!(top[0].conversion_rate, 0.0);
        assert_eq!(top[1].product_id, product_b);
        assert_eq!(top[1].total_events, 1);
        assert_eq!(top[1].unique_users, 1);

        let purchases = store
            .top_products(ts(8, 0), ts(10, 0), 10, Some(EventType::Purchase))
            .await
            .unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].product_id, product_a);
        assert_eq!(purchases[0].total_events, 1);

        let top_one = store
            .top_products(ts(8, 0), ts(10, 0), 1, None)
            .await
            .unwrap();
        assert_eq!(top_one.len(), 1);
        assert_eq!(top_one[0].product_id, product_a);
    }
}
