use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use time::Duration;

use common_store::summaries::SummaryStore;
use health::{HealthHandle, HealthRegistry};

use crate::config::Config;
use crate::working_set::{DistinctCounter, WorkingSet};

pub struct AppContext {
    pub pool: PgPool,
    pub summaries: SummaryStore,
    pub working_set: Box<dyn DistinctCounter + Send + Sync>,
    pub liveness: HealthRegistry,
    pub worker_liveness: HealthHandle,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, sqlx::Error> {
        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let liveness = HealthRegistry::new("liveness");
        let worker_liveness = liveness.register("worker".to_string(), Duration::seconds(60));

        Self {
            summaries: SummaryStore::new(pool.clone()),
            pool,
            working_set: Box::new(WorkingSet::new()),
            liveness,
            worker_liveness,
        }
    }
}
