use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Link status
        .route("/link/status", get(handlers::link_status))
        // Local state reports
        .route("/link/recording-state", post(handlers::set_recording_state))
        .route("/link/lifecycle", post(handlers::set_lifecycle))
        // Transfers
        .route("/link/sync", post(handlers::start_sync))
        .route(
            "/link/sync/:recording_id/cancel",
            post(handlers::cancel_sync),
        )
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
