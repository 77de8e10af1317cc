//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{BridgeGateway, DbAdapter, FakeGateway, MemoryStore},
    config::{Config, GatewayKind},
    error::ApiError,
    web::{self, state::AppState},
};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wa_bridge_core::{
    MessageRepository, ProviderGateway, RelayOptions, RelayService, RetryPolicy,
    SessionRepository,
};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Select the Store & Run Migrations ---
    let (session_repo, message_repo) = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(database_url)
                .await?;
            let db_adapter = Arc::new(DbAdapter::new(db_pool));
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            (
                db_adapter.clone() as Arc<dyn SessionRepository>,
                db_adapter as Arc<dyn MessageRepository>,
            )
        }
        None => {
            warn!("DATABASE_URL is not set; sessions and messages live in memory only.");
            let store = Arc::new(MemoryStore::new());
            (
                store.clone() as Arc<dyn SessionRepository>,
                store as Arc<dyn MessageRepository>,
            )
        }
    };

    // --- 3. Initialize the Provider Gateway ---
    let gateway: Arc<dyn ProviderGateway> = match config.gateway {
        GatewayKind::Bridge => {
            info!("Using the WhatsApp Web bridge at {}", config.bridge_url);
            Arc::new(BridgeGateway::new(&config.bridge_url, config.bridge_timeout)?)
        }
        GatewayKind::Fake => {
            warn!("Using the fake provider gateway; no real messages will be sent.");
            Arc::new(FakeGateway::new())
        }
    };

    // --- 4. Build the Shared AppState ---
    let options = RelayOptions {
        retry: RetryPolicy::new(config.provider_max_attempts, config.provider_backoff),
        queue_capacity: config.notify_queue_capacity,
    };
    let relay = Arc::new(RelayService::new(session_repo, message_repo, gateway, options));
    let app_state = Arc::new(AppState {
        relay,
        config: config.clone(),
    });

    // --- 5. Create the Web Router ---
    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|e| {
        ApiError::Internal(format!("Invalid CORS_ORIGIN '{}': {}", config.cors_origin, e))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(web::middleware::USER_HEADER),
        ]);
    let app = web::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received.");
            }
            shutdown.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server stopped.");
    Ok(())
}
