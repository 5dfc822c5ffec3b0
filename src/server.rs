use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

/// The HTTP mirror of the engine operations. The listener binds loopback
/// only (see `AppConfig::listen_addr`); there is no authentication layer,
/// callers on the same host are trusted.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/shutdown", post(routes::health::shutdown_handler))
        .route("/api/ingest", post(routes::ingest::ingest))
        .route("/api/search", post(routes::search::search))
        .route("/api/content/{content_id}", get(routes::content::get_content))
        .route("/api/stats", get(routes::admin::get_stats))
        .route("/api/reset", post(routes::admin::reset))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
