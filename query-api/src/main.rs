use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use sqlx::postgres::PgPoolOptions;

use common_metrics::setup_metrics_routes;
use common_store::events::EventStore;
use common_store::summaries::SummaryStore;

mod api;
mod config;
mod handlers;
mod stats;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
    let pool = options
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    let app = handlers::add_routes(
        Router::new(),
        EventStore::new(pool.clone()),
        SummaryStore::new(pool),
    );
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start query-api http server, {}", e),
    }
}
