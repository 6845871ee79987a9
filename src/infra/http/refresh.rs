//! Authenticated refresh triggers.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::application::jobs::RunRecord;
use crate::application::refresh::{RefreshOptions, RefreshReport, RefreshScope};

use super::error::ApiError;
use super::state::HttpState;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshRequest {
    pub scope: RefreshScope,
    pub force: bool,
    pub packages: Vec<String>,
}

impl Default for RefreshRequest {
    fn default() -> Self {
        Self {
            scope: RefreshScope::All,
            force: false,
            packages: Vec::new(),
        }
    }
}

impl RefreshRequest {
    fn into_parts(self) -> (RefreshScope, RefreshOptions) {
        (
            self.scope,
            RefreshOptions {
                force: self.force,
                packages: self.packages,
            },
        )
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedRun {
    pub run_id: Uuid,
    pub scope: RefreshScope,
    pub status_url: String,
}

/// Reject requests that lack the configured bearer secret.
pub async fn refresh_auth(
    State(state): State<HttpState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(secret) = state.refresh_secret.as_deref() else {
        return ApiError::refresh_disabled().into_response();
    };

    match bearer_token(request.headers()) {
        Some(token) if bool::from(token.as_bytes().ct_eq(secret.as_bytes())) => {
            next.run(request).await
        }
        _ => ApiError::unauthorized().into_response(),
    }
}

/// Run a refresh to completion and return its report.
pub async fn refresh_now(
    State(state): State<HttpState>,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<RefreshReport>, ApiError> {
    let (scope, options) = body.map(|Json(body)| body).unwrap_or_default().into_parts();
    let report = state.orchestrator.refresh(scope, &options).await?;
    Ok(Json(report))
}

/// Queue a refresh and answer immediately with its run id.
pub async fn refresh_background(
    State(state): State<HttpState>,
    body: Option<Json<RefreshRequest>>,
) -> Result<Response, ApiError> {
    let (scope, options) = body.map(|Json(body)| body).unwrap_or_default().into_parts();
    let run_id = state.supervisor.submit(scope, options)?;
    let accepted = AcceptedRun {
        run_id,
        scope,
        status_url: format!("/refresh/runs/{run_id}"),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

pub async fn refresh_run_status(
    State(state): State<HttpState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunRecord>, ApiError> {
    state
        .supervisor
        .status(run_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Unknown refresh run", Some(run_id.to_string())))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    raw.strip_prefix("Bearer ").map(str::trim)
}
