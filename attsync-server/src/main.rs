mod routes;

use attsync_core::config::SyncConfig;
use attsync_core::device::mock::MockConnector;
use attsync_core::device::DeviceConnector;
use attsync_core::end_store::EndStore;
use attsync_core::service::SyncService;
use attsync_core::store::SyncStore;
use attsync_core::store_memory::MemoryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = SyncConfig::from_env();

    let store: Arc<dyn SyncStore> = match std::env::var("DATABASE_URL").ok() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = attsync_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let end_store: Option<Arc<dyn EndStore>> = match &config.end_db_uri {
        #[cfg(feature = "postgres")]
        Some(uri) => {
            tracing::info!("Connecting to end database...");
            let pool = sqlx::PgPool::connect(uri).await?;
            let end = attsync_core::end_postgres::PgEndStore::new(pool, &config.end_target_table)?;
            end.ensure_table().await?;
            Some(Arc::new(end))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("END_DB_URI set but postgres feature not enabled; exports disabled");
            None
        }
        None => {
            tracing::info!("No END_DB_URI configured; exports will fail fast");
            None
        }
    };

    // The terminal-protocol client is an out-of-tree capability; the
    // scripted connector keeps the control plane operable without it.
    let connector: Arc<dyn DeviceConnector> = Arc::new(MockConnector::new());
    tracing::warn!("no terminal adapter wired; using the scripted connector");

    let service = SyncService::new(store, connector, end_store, config);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("attsync control plane listening on {bind_addr}");
    axum::serve(listener, routes::router(service)).await?;

    Ok(())
}
