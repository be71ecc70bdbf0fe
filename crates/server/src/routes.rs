//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // The upload surface accepts a whole file set in one request.
    let upload_body_limit = (state.config.upload.max_file_size_bytes as usize)
        .saturating_mul(state.config.upload.max_files_per_request)
        .saturating_add(1024 * 1024);

    let api_routes = Router::new()
        // Health check (intentionally unauthenticated for load balancers)
        .route("/v1/health", get(handlers::health_check))
        // Upload surface
        .route(
            "/v1/media",
            post(handlers::upload_media).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        // Cleanup endpoints (all require the admin token)
        .route("/v1/admin/cleanup/scan", post(handlers::scan_cleanup))
        .route("/v1/admin/cleanup/execute", post(handlers::execute_cleanup))
        .route("/v1/admin/cleanup/jobs", get(handlers::list_cleanup_jobs))
        .route(
            "/v1/admin/cleanup/jobs/{job_id}",
            get(handlers::get_cleanup_job),
        )
        .route(
            "/v1/admin/cleanup/jobs/{job_id}/cancel",
            post(handlers::cancel_cleanup_job),
        );

    let mut router = Router::new().merge(api_routes);

    // SECURITY: when enabled, /metrics MUST be network-restricted to
    // authorized Prometheus scraper IPs. See crate::metrics for details.
    if state.config.server.metrics_enabled {
        router = router.merge(Router::new().route("/metrics", get(metrics_handler)));
    }

    router
        // Auth middleware (validates the admin token, sets trace context)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
