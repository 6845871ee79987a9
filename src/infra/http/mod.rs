mod error;
mod middleware;
mod refresh;
mod state;
mod stats;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use refresh::{AcceptedRun, RefreshRequest};
pub use state::HttpState;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sqlx::Error as SqlxError;

use crate::application::error::ErrorReport;

/// Read API, tool interface, refresh triggers and health probe.
pub fn build_router(state: HttpState) -> Router {
    let triggers = Router::new()
        .route("/refresh", post(refresh::refresh_now))
        .route("/refresh-background", post(refresh::refresh_background))
        .route("/refresh/runs/{id}", get(refresh::refresh_run_status))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            refresh::refresh_auth,
        ));

    Router::new()
        .route("/api/stats/org", get(stats::org_stats))
        .route("/api/stats/libraries", get(stats::list_libraries))
        .route("/api/stats/libraries/{id}", get(stats::library_stats))
        .route("/api/stats/compare", get(stats::compare))
        .route("/api/stats/presets", get(stats::list_presets))
        .route("/api/tools", get(stats::list_tools))
        .route("/api/tools/invoke", post(stats::invoke_tool))
        .route("/_health", get(health))
        .merge(triggers)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

async fn health(State(state): State<HttpState>) -> Response {
    match state.db.as_ref() {
        Some(db) => db_health_response(db.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
