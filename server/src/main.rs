use lrsr_auth::{BrokerConfig, BrokerServer};
use miette::{IntoDiagnostic, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::str::FromStr;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod store;

async fn init_db(db_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .into_diagnostic()?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await.into_diagnostic()?;

    let migration_sql = include_str!("../migrations/001_broker_schema.sql");
    sqlx::raw_sql(migration_sql)
        .execute(&pool)
        .await
        .into_diagnostic()?;

    Ok(pool)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("server=debug,lrsr_auth=debug,info")),
        )
        .init();

    let config = BrokerConfig::from_env().into_diagnostic()?;

    let db_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:lrsr.db".to_string());
    let pool = init_db(&db_url).await?;

    let store = store::SqliteStore::builder(pool).build();
    store.spawn_sweeper();

    let broker = BrokerServer::builder()
        .config(config)
        .state_store(store.clone())
        .user_store(store)
        .build()
        .into_diagnostic()?;

    let app = broker.router().layer(TraceLayer::new_for_http());

    let addr = std::env::var("LRSR_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .into_diagnostic()?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;
    Ok(())
}
