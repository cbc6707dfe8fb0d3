use std::sync::Arc;
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use library_payments::{
    api,
    clock::{Clock, SystemClock},
    config::Settings,
    payments::GatewayClient,
    service::ServiceContext,
    worker::Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "library_payments=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Settings::new().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}. Using defaults.", e);
        Settings::default()
    });

    tracing::info!(
        "Starting payment service on {}:{} (gateway: {:?})",
        settings.server.host,
        settings.server.port,
        settings.gateway.environment
    );
    if settings.gateway.webhook_secret.is_none() {
        tracing::warn!("No gateway.webhook_secret configured; payment callbacks are not authenticated");
    }

    // Initialize database
    let db_pool = SqlitePoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Arc::new(GatewayClient::new(settings.gateway.clone(), clock.clone())?);
    let service_context = Arc::new(ServiceContext::new(db_pool, gateway, clock, &settings));

    // Background sweeps share the server's lifetime
    let shutdown = CancellationToken::new();
    let worker_handles = if settings.worker.enabled {
        let worker = Arc::new(Worker::new(&service_context, settings.worker.clone()));
        worker.start(shutdown.clone())
    } else {
        tracing::info!("Payment worker disabled");
        Vec::new()
    };

    let app = api::create_app(service_context, Arc::new(settings.clone()));

    let listener = tokio::net::TcpListener::bind(
        format!("{}:{}", settings.server.host, settings.server.port)
    ).await?;

    tracing::info!("Server listening on http://{}:{}", settings.server.host, settings.server.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for handle in worker_handles {
        if let Err(e) = handle.await {
            tracing::error!("Worker task ended abnormally: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
