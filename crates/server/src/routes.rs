//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/capabilities", get(handlers::get_capabilities))
        // Uploads
        .route("/v1/uploads", post(handlers::create_upload))
        .route(
            "/v1/uploads/{upload_id}",
            get(handlers::get_upload).delete(handlers::abort_upload),
        )
        .route(
            "/v1/uploads/{upload_id}/chunks/{chunk_index}",
            post(handlers::upload_chunk),
        )
        .route(
            "/v1/uploads/{upload_id}/complete",
            post(handlers::complete_upload),
        )
        // Tasks
        .route("/v1/tasks/generate", post(handlers::start_generate))
        .route("/v1/tasks/refine", post(handlers::start_refine))
        .route("/v1/tasks/{task_id}", get(handlers::get_task))
        .route("/v1/tasks/{task_id}/cancel", post(handlers::cancel_task))
        .route("/v1/tasks/{task_id}/events", get(handlers::task_events))
        .route("/v1/tasks/{task_id}/output", get(handlers::get_task_output));

    let mut router = Router::new().merge(api_routes);

    // Unauthenticated; restrict at the network layer if exposed.
    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
