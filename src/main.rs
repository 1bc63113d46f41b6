//! care_market - home-care marketplace coordination server
//!
//! Serves the marketplace engine over HTTP. Uses Postgres when
//! `DATABASE_URL` is set and an in-memory store otherwise.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use care_market::clock::SystemClock;
use care_market::external::{HmacPaymentVerifier, JwtIdentityVerifier};
use care_market::store::{KvStore, MemoryStore, PgKvStore};
use care_market::{api, db, Config, Engine};

/// Initialize tracing/logging
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "care_market=debug,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;
    init_tracing(config.is_production());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, "Starting care_market server");

    let mut pool = None;
    let store: Arc<dyn KvStore> = match config.database_url.as_deref() {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let connected = db::connect(url, config.database_max_connections).await?;

            if !db::check_schema(&connected).await? {
                tracing::error!("Database schema is not complete. Please run migrations.");
                return Err(anyhow::anyhow!("Database schema incomplete"));
            }
            tracing::info!("Database connected successfully");
            pool = Some(connected.clone());
            Arc::new(PgKvStore::new(connected))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(Engine::new(
        store,
        Arc::new(JwtIdentityVerifier::new(&config.jwt_secret)),
        Arc::new(HmacPaymentVerifier::new(&config.payment_key_secret)),
        Arc::new(SystemClock),
        config.engine_settings(),
    ));

    let jobs = engine.scheduler().start();

    let app = api::build_app(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    jobs.abort();
    if let Some(pool) = pool {
        pool.close().await;
        tracing::info!("Database connections closed");
    }
    tracing::info!("Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
