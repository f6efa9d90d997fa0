use chrono::{DateTime, Utc};

pub trait TimeSource {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock, lets tests pin the server-side `created_at` default.
#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}
