//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::*;

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use apalis_cron::Schedule;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "libstats";
const ENV_PREFIX: &str = "LIBSTATS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_NPM_BASE_URL: &str = "https://api.npmjs.org";
const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_GITHUB_WEB_URL: &str = "https://github.com";
const DEFAULT_USER_AGENT: &str = concat!("libstats/", env!("CARGO_PKG_VERSION"));
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_UPSTREAM_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_NPM_MAX_RANGE_DAYS: u32 = 540;
pub(crate) const DEFAULT_REFRESH_SCHEDULE: &str = "0 0 */6 * * *";
const DEFAULT_REFRESH_CONCURRENCY: u32 = 8;
const DEFAULT_BATCH_DELAY_MS: u64 = 500;
const DEFAULT_REFRESH_BUDGET_SECS: u64 = 15 * 60;
const DEFAULT_CHUNK_SIZE_DAYS: u32 = crate::domain::chunks::DEFAULT_CHUNK_SIZE_DAYS;
const DEFAULT_BACKGROUND_WORKERS: u32 = 1;
const DEFAULT_BACKGROUND_QUEUE: u32 = 16;
const DEFAULT_MUTABLE_TTL_SECS: u64 = 6 * 60 * 60;
const DEFAULT_MEMO_LIMIT: usize = 2048;
const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_CATALOG_PATH: &str = "config/catalog.toml";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub upstream: UpstreamSettings,
    pub refresh: RefreshSettings,
    pub cache: CacheSettings,
    pub catalog: CatalogSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Without a URL the cache lives in process memory.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Clone)]
pub struct UpstreamSettings {
    pub npm_base_url: Url,
    pub github_api_url: Url,
    pub github_web_url: Url,
    pub github_token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_attempts: NonZeroU32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub npm_max_range_days: NonZeroU32,
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("npm_base_url", &self.npm_base_url.as_str())
            .field("github_api_url", &self.github_api_url.as_str())
            .field("github_web_url", &self.github_web_url.as_str())
            .field("github_token", &self.github_token.as_ref().map(|_| "[REDACTED]"))
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("npm_max_range_days", &self.npm_max_range_days)
            .finish()
    }
}

#[derive(Clone)]
pub struct RefreshSettings {
    /// Bearer secret for the on-demand triggers. Unset disables them.
    pub secret: Option<String>,
    pub schedule: String,
    pub schedule_enabled: bool,
    pub concurrency: NonZeroU32,
    pub batch_delay: Duration,
    pub budget: Duration,
    pub chunk_size_days: NonZeroU32,
    pub background_workers: NonZeroU32,
    pub background_queue: NonZeroU32,
}

impl std::fmt::Debug for RefreshSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshSettings")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("schedule", &self.schedule)
            .field("schedule_enabled", &self.schedule_enabled)
            .field("concurrency", &self.concurrency)
            .field("batch_delay", &self.batch_delay)
            .field("budget", &self.budget)
            .field("chunk_size_days", &self.chunk_size_days)
            .field("background_workers", &self.background_workers)
            .field("background_queue", &self.background_queue)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub mutable_ttl_secs: u64,
    pub memo_limit: usize,
    pub retention_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Refresh(args)) => {
            raw.apply_database_override(&args.database);
            raw.apply_catalog_override(&args.catalog);
        }
        Some(Command::Plan(args)) => raw.apply_catalog_override(&args.catalog),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    upstream: RawUpstreamSettings,
    refresh: RawRefreshSettings,
    cache: RawCacheSettings,
    catalog: RawCatalogSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(schedule) = overrides.refresh_schedule.as_ref() {
            self.refresh.schedule = Some(schedule.clone());
        }
        if let Some(enabled) = overrides.refresh_schedule_enabled {
            self.refresh.schedule_enabled = Some(enabled);
        }
        if let Some(concurrency) = overrides.refresh_concurrency {
            self.refresh.concurrency = Some(concurrency);
        }

        self.apply_database_override(&overrides.database);
        self.apply_catalog_override(&overrides.catalog);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_catalog_override(&mut self, overrides: &CatalogOverride) {
        if let Some(path) = overrides.catalog_path.as_ref() {
            self.catalog.path = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            upstream,
            refresh,
            cache,
            catalog,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            upstream: build_upstream_settings(upstream)?,
            refresh: build_refresh_settings(refresh)?,
            cache: build_cache_settings(cache)?,
            catalog: build_catalog_settings(catalog)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let npm_base_url = parse_url(
        upstream.npm_base_url.as_deref(),
        DEFAULT_NPM_BASE_URL,
        "upstream.npm_base_url",
    )?;
    let github_api_url = parse_url(
        upstream.github_api_url.as_deref(),
        DEFAULT_GITHUB_API_URL,
        "upstream.github_api_url",
    )?;
    let github_web_url = parse_url(
        upstream.github_web_url.as_deref(),
        DEFAULT_GITHUB_WEB_URL,
        "upstream.github_web_url",
    )?;

    let user_agent = non_blank(upstream.user_agent).unwrap_or_else(|| DEFAULT_USER_AGENT.into());

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let backoff_base_ms = upstream.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
    let backoff_max_ms = upstream.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS);
    if backoff_max_ms < backoff_base_ms {
        return Err(LoadError::invalid(
            "upstream.backoff_max_ms",
            "must not be smaller than upstream.backoff_base_ms",
        ));
    }

    Ok(UpstreamSettings {
        npm_base_url,
        github_api_url,
        github_web_url,
        github_token: non_blank(upstream.github_token),
        user_agent,
        timeout: Duration::from_secs(timeout_secs),
        max_attempts: non_zero_u32(
            upstream
                .max_attempts
                .unwrap_or(DEFAULT_UPSTREAM_MAX_ATTEMPTS)
                .into(),
            "upstream.max_attempts",
        )?,
        backoff_base: Duration::from_millis(backoff_base_ms),
        backoff_max: Duration::from_millis(backoff_max_ms),
        npm_max_range_days: non_zero_u32(
            upstream
                .npm_max_range_days
                .unwrap_or(DEFAULT_NPM_MAX_RANGE_DAYS)
                .into(),
            "upstream.npm_max_range_days",
        )?,
    })
}

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let schedule = non_blank(refresh.schedule).unwrap_or_else(|| DEFAULT_REFRESH_SCHEDULE.into());
    Schedule::from_str(&schedule).map_err(|err| {
        LoadError::invalid("refresh.schedule", format!("invalid cron expression: {err}"))
    })?;

    let budget_secs = refresh.budget_seconds.unwrap_or(DEFAULT_REFRESH_BUDGET_SECS);
    if budget_secs == 0 {
        return Err(LoadError::invalid(
            "refresh.budget_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RefreshSettings {
        secret: non_blank(refresh.secret),
        schedule,
        schedule_enabled: refresh.schedule_enabled.unwrap_or(true),
        concurrency: non_zero_u32(
            refresh
                .concurrency
                .unwrap_or(DEFAULT_REFRESH_CONCURRENCY)
                .into(),
            "refresh.concurrency",
        )?,
        batch_delay: Duration::from_millis(
            refresh.batch_delay_ms.unwrap_or(DEFAULT_BATCH_DELAY_MS),
        ),
        budget: Duration::from_secs(budget_secs),
        chunk_size_days: non_zero_u32(
            refresh
                .chunk_size_days
                .unwrap_or(DEFAULT_CHUNK_SIZE_DAYS)
                .into(),
            "refresh.chunk_size_days",
        )?,
        background_workers: non_zero_u32(
            refresh
                .background_workers
                .unwrap_or(DEFAULT_BACKGROUND_WORKERS)
                .into(),
            "refresh.background_workers",
        )?,
        background_queue: non_zero_u32(
            refresh
                .background_queue
                .unwrap_or(DEFAULT_BACKGROUND_QUEUE)
                .into(),
            "refresh.background_queue",
        )?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let mutable_ttl_secs = cache.mutable_ttl_secs.unwrap_or(DEFAULT_MUTABLE_TTL_SECS);
    if mutable_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.mutable_ttl_secs",
            "must be greater than zero",
        ));
    }
    i64::try_from(mutable_ttl_secs).map_err(|_| {
        LoadError::invalid(
            "cache.mutable_ttl_secs",
            "value exceeds supported range for i64",
        )
    })?;

    Ok(CacheSettings {
        mutable_ttl_secs,
        memo_limit: cache.memo_limit.unwrap_or(DEFAULT_MEMO_LIMIT),
        retention_secs: cache.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS),
    })
}

fn build_catalog_settings(catalog: RawCatalogSettings) -> Result<CatalogSettings, LoadError> {
    let path = catalog
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("catalog.path", "path must not be empty"));
    }
    Ok(CatalogSettings { path })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    npm_base_url: Option<String>,
    github_api_url: Option<String>,
    github_web_url: Option<String>,
    github_token: Option<String>,
    user_agent: Option<String>,
    timeout_seconds: Option<u64>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    npm_max_range_days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    secret: Option<String>,
    schedule: Option<String>,
    schedule_enabled: Option<bool>,
    concurrency: Option<u32>,
    batch_delay_ms: Option<u64>,
    budget_seconds: Option<u64>,
    chunk_size_days: Option<u32>,
    background_workers: Option<u32>,
    background_queue: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    mutable_ttl_secs: Option<u64>,
    memo_limit: Option<usize>,
    retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCatalogSettings {
    path: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_url(value: Option<&str>, default: &str, key: &'static str) -> Result<Url, LoadError> {
    let raw = value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default);
    let url = Url::parse(raw).map_err(|err| LoadError::invalid(key, format!("{err}")))?;
    if url.cannot_be_a_base() {
        return Err(LoadError::invalid(key, "URL cannot be used as a base"));
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
