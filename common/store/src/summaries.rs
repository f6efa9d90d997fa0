use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;

use crate::error::StoreError;
use crate::events::EventType;

/// The aggregation bucket: one summary row exists per (date, hour, type).
/// All bucketing is computed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SummaryKey {
    pub date: NaiveDate,
    pub hour: i32,
    pub event_type: EventType,
}

impl SummaryKey {
    pub fn for_event(event_type: EventType, created_at: DateTime<Utc>) -> Self {
        Self {
            date: created_at.date_naive(),
            hour: created_at.hour() as i32,
            event_type,
        }
    }
}

/// A stored per-bucket rollup. `total_events` only ever grows;
/// `unique_users` holds whatever cardinality the last writer knew.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Summary {
    pub id: i64,
    pub date: NaiveDate,
    pub hour: i32,
    pub event_type: EventType,
    pub total_events: i64,
    pub unique_users: i64,
    pub metadata: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// An increment to merge into a bucket. `total_events` is added to the
/// stored row, everything else replaces it.
pub struct NewSummary {
    pub key: SummaryKey,
    pub total_events: i64,
    pub unique_users: i64,
    pub metadata: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for summary rows, implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct SummaryStore {
    pool: PgPool,
}

impl SummaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Merge an increment into its bucket atomically and return the row id.
    /// Concurrent upserts compose: additions accumulate, the last writer
    /// wins on `unique_users`, `metadata` and `updated_at`.
    pub async fn upsert(&self, summary: &NewSummary) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO analytics_summary (date, hour, event_type, total_events, unique_users, metadata, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (date, hour, event_type)
DO UPDATE SET
    total_events = analytics_summary.total_events + EXCLUDED.total_events,
    unique_users = EXCLUDED.unique_users,
    metadata = EXCLUDED.metadata,
    updated_at = EXCLUDED.updated_at
RETURNING id
            "#,
        )
        .bind(summary.key.date)
        .bind(summary.key.hour)
        .bind(summary.key.event_type)
        .bind(summary.total_events)
        .bind(summary.unique_users)
        .bind(&summary.metadata)
        .bind(summary.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })
    }

    pub async fn get(&self, key: &SummaryKey) -> Result<Option<Summary>, StoreError> {
        sqlx::query_as::<_, Summary>(
            r#"
SELECT id, date, hour, event_type, total_events, unique_users, metadata, updated_at
FROM analytics_summary
WHERE date = $1 AND hour = $2 AND event_type = $3
            "#,
        )
        .bind(key.date)
        .bind(key.hour)
        .bind(key.event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Summaries within an inclusive date range, ordered by (date, hour).
    pub async fn get_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        event_type: Option<EventType>,
    ) -> Result<Vec<Summary>, StoreError> {
        let mut query = String::from(
            r#"
SELECT id, date, hour, event_type, total_events, unique_users, metadata, updated_at
FROM analytics_summary
WHERE date >= $1 AND date <= $2
            "#,
        );
        if event_type.is_some() {
            query.push_str(" AND event_type = $3");
        }
        query.push_str(" ORDER BY date, hour");

        let mut rows = sqlx::query_as::<_, Summary>(&query).bind(from).bind(to);
        if let Some(event_type) = event_type {
            rows = rows.bind(event_type);
        }

        rows.fetch_all(&self.pool)
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
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn key(d: u32, hour: i32, event_type: EventType) -> SummaryKey {
        SummaryKey {
            date: day(d),
            hour,
            event_type,
        }
    }

    fn increment(key: SummaryKey, unique_users: i64) -> NewSummary {
        NewSummary {
            key,
            total_events: 1,
            unique_users,
            metadata: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn for_event_buckets_in_utc() {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 5, 9, 59, 59).unwrap();
        let key = SummaryKey::for_event(EventType::PageView, created_at);
        assert_eq!(key.date, day(5));
        assert_eq!(key.hour, 9);

        let midnight = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap();
        let key = SummaryKey::for_event(EventType::Search, midnight);
        assert_eq!(key.date, day(6));
        assert_eq!(key.hour, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_accumulates_totals(db: PgPool) {
        let store = SummaryStore::new(db);
        let key = key(5, 9, EventType::PageView);

        let first = store.upsert(&increment(key, 1)).await.unwrap();
        let second = store.upsert(&increment(key, 2)).await.unwrap();
        let third = store.upsert(&increment(key, 2)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);

        let summary = store.get(&key).await.unwrap().unwrap();
        assert_eq!(summary.id, first);
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.unique_users, 2);
        assert_eq!(summary.metadata, None);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_replaces_metadata(db: PgPool) {
        let store = SummaryStore::new(db);
        let key = key(5, 9, EventType::Purchase);

        let mut update = increment(key, 1);
        update.metadata = Some(json!({"source": "checkout"}));
        store.upsert(&update).await.unwrap();

        let mut update = increment(key, 1);
        update.metadata = Some(json!({"source": "cart"}));
        store.upsert(&update).await.unwrap();

        let summary = store.get(&key).await.unwrap().unwrap();
        assert_eq!(summary.total_events, 2);
        assert_eq!(summary.metadata, Some(json!({"source": "cart"})));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_range_is_inclusive_and_ordered(db: PgPool) {
        let store = SummaryStore::new(db);
        for k in [
            key(4, 23, EventType::PageView),
            key(5, 9, EventType::PageView),
            key(5, 9, EventType::Purchase),
            key(5, 11, EventType::PageView),
            key(6, 0, EventType::PageView),
        ] {
            store.upsert(&increment(k, 1)).await.unwrap();
        }

        let range = store.get_range(day(4), day(5), None).await.unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!((range[0].date, range[0].hour), (day(4), 23));
        assert_eq!((range[1].date, range[1].hour), (day(5), 9));
        assert_eq!((range[2].date, range[2].hour), (day(5), 9));
        assert_eq!((range[3].date, range[3].hour), (day(5), 11));

        let mut bucket_types: Vec<String> =
            range[1..3].iter().map(|s| s.event_type.to_string()).collect();
        bucket_types.sort();
        assert_eq!(bucket_types, vec!["page_view", "purchase"]);

        let views = store
            .get_range(day(4), day(6), Some(EventType::PageView))
            .await
            .unwrap();
        assert_eq!(views.len(), 4);
        assert!(views.iter().all(|s| s.event_type == EventType::PageView));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_returns_none_for_missing_bucket(db: PgPool) {
        let store = SummaryStore::new(db);
        let missing = store
            .get(&key(1, 0, EventType::Search))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
