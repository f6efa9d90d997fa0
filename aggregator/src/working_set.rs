use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::NaiveDate;
use uuid::Uuid;

use common_store::summaries::SummaryKey;

/// Distinct-user tracking behind a seam, so the message loop does not care
/// where cardinalities come from. The default [`WorkingSet`] is process
/// local: counts restart from zero when the process does, and two instances
/// consuming partitions of the same topic each report their own partial
/// count, last writer winning in storage. A shared or probabilistic counter
/// can be swapped in here without touching the loop.
pub trait DistinctCounter {
    /// Record one user under a bucket and return the bucket's new cardinality.
    fn observe(&self, key: SummaryKey, user_id: Uuid) -> i64;

    /// Drop every bucket dated strictly before the cutoff. Returns how many
    /// buckets were dropped.
    fn evict_older_than(&self, cutoff: NaiveDate) -> usize;

    /// Number of buckets currently tracked.
    fn tracked_keys(&self) -> usize;
}

/// In-memory per-bucket user sets. All mutation happens under one mutex and
/// never spans an await point; the per-message critical section is a hash
/// insert.
#[derive(Default)]
pub struct WorkingSet {
    buckets: Mutex<HashMap<SummaryKey, HashSet<Uuid>>>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistinctCounter for WorkingSet {
    fn observe(&self, key: SummaryKey, user_id: Uuid) -> i64 {
        let mut buckets = self.buckets.lock().expect("poisoned WorkingSet lock");
        let users = buckets.entry(key).or_default();
        users.insert(user_id);
        users.len() as i64
    }

    fn evict_older_than(&self, cutoff: NaiveDate) -> usize {
        let mut buckets = self.buckets.lock().expect("poisoned WorkingSet lock");
        let before = buckets.len();
        buckets.retain(|key, _| key.date >= cutoff);
        before - buckets.len()
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.lock().expect("poisoned WorkingSet lock").len()
    }
}
