use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::jobs::SupervisorError;
use crate::application::refresh::RefreshError;
use crate::application::stats::StatsError;
use crate::application::tools::ToolError;
use crate::domain::error::DomainError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const STATS_UNAVAILABLE: &str = "stats_unavailable";
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const ALREADY_RUNNING: &str = "already_running";
    pub const QUEUE_FULL: &str = "queue_full";
    pub const REFRESH_DISABLED: &str = "refresh_disabled";
    pub const CACHE: &str = "cache_error";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "Refresh secret required",
            None,
        )
    }

    /// The trigger endpoints exist but no secret was configured.
    pub fn refresh_disabled() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::REFRESH_DISABLED,
            "Refresh secret is not configured",
            Some("set refresh.secret or LIBSTATS__REFRESH__SECRET".to_string()),
        )
    }

    pub fn not_found(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, hint)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http::api",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}

impl From<StatsError> for ApiError {
    fn from(err: StatsError) -> Self {
        match err {
            StatsError::StatsUnavailable { subject } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::STATS_UNAVAILABLE,
                "Statistics have not been cached yet",
                Some(format!("`{subject}` is populated by the next refresh")),
            ),
            StatsError::UnknownLibrary(id) => {
                ApiError::not_found("Unknown library", Some(format!("`{id}` is not tracked")))
            }
            StatsError::Invalid(DomainError::NotFound { kind, id }) => {
                ApiError::not_found("Unknown resource", Some(format!("{kind} `{id}`")))
            }
            StatsError::Invalid(err) => ApiError::bad_request("Invalid request", Some(err.to_string())),
            StatsError::Cache(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::CACHE,
                "Cache backend unavailable",
                Some(err.to_string()),
            ),
        }
    }
}

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::UnknownTool(name) => ApiError::new(
                StatusCode::NOT_FOUND,
                codes::UNKNOWN_TOOL,
                "Unknown tool",
                Some(format!("`{name}` is not a registered tool")),
            ),
            ToolError::InvalidArguments { .. } => {
                ApiError::bad_request("Invalid tool arguments", Some(err.to_string()))
            }
            ToolError::Stats(err) => err.into(),
            ToolError::Encode(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL,
                "Tool output could not be encoded",
                Some(err.to_string()),
            ),
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::AlreadyRunning { .. } => ApiError::new(
                StatusCode::CONFLICT,
                codes::ALREADY_RUNNING,
                "A refresh of this scope is already running",
                Some(err.to_string()),
            ),
            RefreshError::UnknownOrg { .. } | RefreshError::NoPackages => {
                ApiError::bad_request("Invalid refresh request", Some(err.to_string()))
            }
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::QueueFull => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::QUEUE_FULL,
                "Background refresh queue is full",
                Some("retry once queued runs have finished".to_string()),
            ),
            SupervisorError::Closed => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL,
                "Background refresh workers are not running",
                None,
            ),
        }
    }
}
