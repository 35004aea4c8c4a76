//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::{header, HeaderValue};
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;

/// Build the application router: JSON API under `/api/v1`, raw logs under `/logs`.
pub fn router(state: AppState) -> Router {
    let logs_dir = state.orchestrator.config().paths.logs_dir();
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .nest_service("/logs", ServeDir::new(logs_dir))
        .fallback(fallback)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
