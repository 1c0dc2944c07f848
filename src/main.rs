use std::net::SocketAddr;
use std::sync::Arc;

use mindmap_pro::api;
use mindmap_pro::config::Config;
use mindmap_pro::db::Database;
use mindmap_pro::handlers::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Configuration loading and validation.
/// - Logging and tracing.
/// - Database connection and schema.
/// - Application state (auth, cache, analysis, migration).
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
///
/// # Returns
///
/// * `anyhow::Result<()>` - Ok if the server runs successfully, or an error if initialization fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so LOG_LEVEL can drive the default filter
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "mindmap_pro={lvl},tower_http={lvl}",
                    lvl = config.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    tracing::info!(
        "Configuration loaded successfully ({:?})",
        config.environment
    );

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database ready at {}", config.database_url);

    let port = config.port;
    let app_state = Arc::new(AppState::new(db.pool.clone(), config));
    tracing::info!(
        "Cache initialized (capacity {} bytes, default TTL {}s)",
        app_state.config.cache_max_capacity,
        app_state.config.cache_default_timeout
    );

    let app = api::rate_limited_router(app_state)?;

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
