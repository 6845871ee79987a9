//! Read API handlers. None of them reach upstream.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;

use crate::application::stats::{
    CompareRequest, Comparison, LibraryListing, StatsError, StatsView,
};
use crate::application::tools::{self, ToolDescriptor, ToolRequest};
use crate::domain::catalog::Preset;
use crate::domain::stats::{LibraryStats, OrgStats};
use crate::domain::types::{Bin, TimeRange};

use super::error::ApiError;
use super::state::HttpState;

#[derive(Debug, Default, Deserialize)]
pub struct CompareQuery {
    /// Comma-separated package names.
    pub packages: Option<String>,
    pub preset: Option<String>,
    pub range: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub bin: Option<String>,
}

impl CompareQuery {
    fn into_request(self, state: &HttpState) -> Result<CompareRequest, StatsError> {
        let mut request = match self.preset.as_deref() {
            Some(id) => CompareRequest::from_preset(state.stats.preset(id)?)?,
            None => CompareRequest {
                packages: Vec::new(),
                range: TimeRange::default(),
                bin: Bin::default(),
            },
        };

        if let Some(packages) = self.packages.as_deref() {
            request.packages = packages
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        if self.range.is_some() || self.from.is_some() || self.to.is_some() {
            request.range =
                TimeRange::from_parts(self.range.as_deref(), self.from.as_deref(), self.to.as_deref())?;
        }
        if let Some(bin) = self.bin.as_deref() {
            request.bin = bin.parse()?;
        }
        Ok(request)
    }
}

pub async fn org_stats(State(state): State<HttpState>) -> Result<Json<StatsView<OrgStats>>, ApiError> {
    Ok(Json(state.stats.get_org_stats().await?))
}

pub async fn list_libraries(
    State(state): State<HttpState>,
) -> Result<Json<Vec<LibraryListing>>, ApiError> {
    Ok(Json(state.stats.list_libraries().await?))
}

pub async fn library_stats(
    State(state): State<HttpState>,
    Path(library_id): Path<String>,
) -> Result<Json<StatsView<LibraryStats>>, ApiError> {
    Ok(Json(state.stats.get_library_stats(&library_id).await?))
}

pub async fn compare(
    State(state): State<HttpState>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<StatsView<Comparison>>, ApiError> {
    let request = query.into_request(&state)?;
    Ok(Json(state.stats.compare_packages(&request).await?))
}

pub async fn list_presets(State(state): State<HttpState>) -> Json<Vec<Preset>> {
    Json(state.stats.list_presets())
}

pub async fn list_tools() -> Json<Vec<ToolDescriptor>> {
    Json(tools::descriptors())
}

pub async fn invoke_tool(
    State(state): State<HttpState>,
    Json(request): Json<ToolRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(tools::dispatch(&state.stats, request).await?))
}
