use std::collections::HashMap;
use std::convert::Infallible;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use common_store::events::{Event, EventType, ProductStats};
use common_store::summaries::Summary;

/// How wide the response buckets are. Summaries are stored hourly, so hour
/// passes rows through and day folds them together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Granularity {
    #[default]
    Hour,
    Day,
}

impl FromStr for Granularity {
    type Err = Infallible;

    // Unknown spellings fall back to hourly instead of failing the request
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Granularity::Day),
            _ => Ok(Granularity::Hour),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventStat {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub total_events: i64,
    pub unique_users: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatsResponse {
    pub stats: Vec<EventStat>,
    pub total_count: i64,
}

#[derive(Debug, Serialize)]
pub struct TopProductsResponse {
    pub products: Vec<ProductStats>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UserActivityResponse {
    pub events: Vec<Event>,
    pub total_events: i64,
}

fn bucket_timestamp(summary: &Summary, granularity: Granularity) -> DateTime<Utc> {
    let midnight = summary.date.and_time(NaiveTime::MIN).and_utc();
    match granularity {
        Granularity::Hour => midnight + Duration::hours(i64::from(summary.hour)),
        Granularity::Day => midnight,
    }
}

/// Merge stored hourly rows into response buckets. Totals add across merged
/// rows. Cardinalities do not: each row carries a distinct-user count scoped
/// to its own hour, so the day value takes the widest hour observed.
pub fn regroup(summaries: Vec<Summary>, granularity: Granularity) -> Vec<EventStat> {
    let mut merged: HashMap<(DateTime<Utc>, EventType), (i64, i64)> = HashMap::new();
    for summary in summaries {
        let bucket = bucket_timestamp(&summary, granularity);
        let entry = merged.entry((bucket, summary.event_type)).or_insert((0, 0));
        entry.0 += summary.total_events;
        entry.1 = entry.1.max(summary.unique_users);
    }

    let mut stats: Vec<EventStat> = merged
        .into_iter()
        .map(|((timestamp, event_type), (total_events, unique_users))| EventStat {
            timestamp,
            event_type,
            total_events,
            unique_users,
        })
        .collect();
    stats.sort_by_key(|stat| (stat.timestamp, stat.event_type.as_str()));
    stats
}
