//! Tool-call interface over the read API.
//!
//! Tools are invoked by name with a JSON object of arguments and answer with
//! the same payloads the HTTP read endpoints return.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use super::stats::{CompareRequest, StatsError, StatsService};
use crate::domain::types::{Bin, TimeRange};

pub const LIST_LIBRARIES: &str = "list_libraries";
pub const GET_ORG_STATS: &str = "get_org_stats";
pub const GET_LIBRARY_STATS: &str = "get_library_stats";
pub const COMPARE_PACKAGES: &str = "compare_packages";
pub const LIST_PRESETS: &str = "list_presets";

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {source}")]
    InvalidArguments {
        tool: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("failed to encode tool output: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LibraryArgs {
    library_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CompareArgs {
    packages: Vec<String>,
    preset: Option<String>,
    range: Option<String>,
    from: Option<String>,
    to: Option<String>,
    bin: Option<String>,
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: LIST_LIBRARIES,
            description: "List every tracked library with its cached download totals.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDescriptor {
            name: GET_ORG_STATS,
            description: "Org-wide downloads, stars, contributors and dependents.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDescriptor {
            name: GET_LIBRARY_STATS,
            description: "Download and GitHub rollup for one library.",
            input_schema: json!({
                "type": "object",
                "properties": { "library_id": { "type": "string" } },
                "required": ["library_id"]
            }),
        },
        ToolDescriptor {
            name: COMPARE_PACKAGES,
            description: "Binned download history for several packages over a time range.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "packages": { "type": "array", "items": { "type": "string" } },
                    "preset": { "type": "string" },
                    "range": { "type": "string", "examples": ["7d", "30d", "90d", "1y", "all"] },
                    "from": { "type": "string", "format": "date" },
                    "to": { "type": "string", "format": "date" },
                    "bin": { "type": "string", "enum": ["daily", "weekly", "monthly"] }
                }
            }),
        },
        ToolDescriptor {
            name: LIST_PRESETS,
            description: "Curated package comparisons.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ]
}

/// Run one tool call against the read API.
pub async fn dispatch(service: &StatsService, request: ToolRequest) -> Result<Value, ToolError> {
    let arguments = match request.arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    match request.tool.as_str() {
        LIST_LIBRARIES => encode(service.list_libraries().await?),
        GET_ORG_STATS => encode(service.get_org_stats().await?),
        GET_LIBRARY_STATS => {
            let args: LibraryArgs = parse_args(GET_LIBRARY_STATS, arguments)?;
            encode(service.get_library_stats(&args.library_id).await?)
        }
        COMPARE_PACKAGES => {
            let args: CompareArgs = parse_args(COMPARE_PACKAGES, arguments)?;
            let request = compare_request(service, args)?;
            encode(service.compare_packages(&request).await?)
        }
        LIST_PRESETS => encode(service.list_presets()),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn compare_request(service: &StatsService, args: CompareArgs) -> Result<CompareRequest, StatsError> {
    let mut request = match args.preset.as_deref() {
        Some(id) => CompareRequest::from_preset(service.preset(id)?)?,
        None => CompareRequest {
            packages: Vec::new(),
            range: TimeRange::default(),
            bin: Bin::default(),
        },
    };

    if !args.packages.is_empty() {
        request.packages = args.packages;
    }
    if args.range.is_some() || args.from.is_some() || args.to.is_some() {
        request.range = TimeRange::from_parts(
            args.range.as_deref(),
            args.from.as_deref(),
            args.to.as_deref(),
        )?;
    }
    if let Some(bin) = args.bin.as_deref() {
        request.bin = bin.parse()?;
    }
    Ok(request)
}

fn parse_args<T: for<'de> Deserialize<'de>>(
    tool: &'static str,
    arguments: Value,
) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|source| ToolError::InvalidArguments { tool, source })
}

fn encode<T: Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(ToolError::Encode)
}
