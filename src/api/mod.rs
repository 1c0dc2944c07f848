//! HTTP routing for the MindMap Pro API.

use crate::handlers::{self, AppState};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

/// All `/api/v1` endpoints, without middleware.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Accounts
        .route("/auth/register", post(handlers::register))
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/change-password", post(handlers::change_password))
        .route("/me", get(handlers::me))
        // Knowledge maps
        .route("/maps", get(handlers::list_maps).post(handlers::create_map))
        .route("/maps/:id", get(handlers::get_map))
        .route("/maps/:id/concepts", post(handlers::add_concept))
        .route(
            "/maps/:id/concepts/:node_id",
            delete(handlers::delete_concept),
        )
        .route("/maps/:id/edges", post(handlers::add_edge))
        .route("/maps/:id/metrics", get(handlers::map_metrics))
        .route("/maps/:id/layout", get(handlers::map_layout))
        // Logs
        .route(
            "/study-records",
            get(handlers::list_study_records).post(handlers::add_study_record),
        )
        .route(
            "/mistakes",
            get(handlers::list_mistakes).post(handlers::add_mistake),
        )
        // Analysis
        .route("/analysis/statistics", get(handlers::statistics))
        .route("/analysis/patterns", get(handlers::patterns))
        .route("/analysis/prediction", get(handlers::prediction))
        .route("/analysis/efficiency", get(handlers::efficiency))
        .route("/analysis/learning", get(handlers::learning_report))
        .route("/analysis/mistakes", get(handlers::mistake_report))
        // Data
        .route("/export", get(handlers::export))
        .route("/cache/stats", get(handlers::cache_stats))
}

/// Wraps the API routes with the health check and shared middleware.
fn compose(state: Arc<AppState>, api: Router<Arc<AppState>>) -> Router {
    let body_limit = state.config.max_content_length;

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// The full application without per-IP rate limiting.
pub fn router(state: Arc<AppState>) -> Router {
    compose(state, api_routes())
}

/// The full application with per-IP rate limiting on `/api/v1`.
///
/// `/health` bypasses the limiter so health checks are never throttled. The server
/// must be run with connect info so the limiter can fall back to the peer
/// address when no forwarding header is present.
pub fn rate_limited_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let per_minute = state.config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / u64::from(per_minute)).max(1))
            .burst_size(per_minute)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );

    let api = api_routes().layer(ServiceBuilder::new().layer(GovernorLayer {
        config: governor_conf,
    }));
    Ok(compose(state, api))
}
