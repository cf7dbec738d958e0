//! Harness Server Entry Point
//!
//! Application entry point and server initialization.
//! Uses `anyhow` for startup errors, but application-level
//! errors should use `kernel::error::AppError`.

use axum::Router;
use harness::domain::repository::JobStore;
use harness::{
    ComposeRuntime, ConnectionRegistry, HarnessAppState, HarnessConfig, MemoryJobStore, PgJobStore,
    Reaper, WorkerPool, harness_router,
};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=info,harness=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(HarnessConfig::from_env()?);

    match env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_workers as u32 + 8)
                .connect(&database_url)
                .await?;

            tracing::info!("Connected to database");

            // Run migrations
            sqlx::migrate!("../../../database/migrations")
                .run(&pool)
                .await?;

            tracing::info!("Migrations completed");

            // Startup cleanup: remove expired challenges
            // Errors here should not prevent server startup
            let store = PgJobStore::new(pool);
            if let Err(e) = store.cleanup_expired().await {
                tracing::warn!(error = %e, "Challenge cleanup failed, continuing anyway");
            }

            serve(Arc::new(store), config).await
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory and lost on restart");
            serve(Arc::new(MemoryJobStore::new()), config).await
        }
    }
}

async fn serve<S>(store: Arc<S>, config: Arc<HarnessConfig>) -> anyhow::Result<()>
where
    S: JobStore + 'static,
{
    let registry = ConnectionRegistry::new();
    let runtime = Arc::new(ComposeRuntime::from_config(&config));

    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        runtime.clone(),
        registry.clone(),
        config.clone(),
    ));
    let reaper = Arc::new(Reaper::new(
        store.clone(),
        runtime,
        registry.clone(),
        config.clone(),
    ));

    let mut loops = pool.spawn();
    loops.push(reaper.spawn());
    tracing::info!(
        workers = config.max_workers,
        max_instances = config.max_instances,
        "Worker pool and reaper started"
    );

    // Build router
    let state = HarnessAppState::new(store, registry, config.clone());
    let app = Router::new()
        .merge(harness_router(state))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Leased jobs keep their lease; the reaper of the next run reclaims them.
    for handle in loops {
        handle.abort();
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
