use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the libstats binary.
#[derive(Debug, Parser)]
#[command(
    name = "libstats",
    version,
    about = "Package and repository statistics cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LIBSTATS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the read API, the refresh triggers and the refresh schedule.
    Serve(Box<ServeArgs>),
    /// Run one refresh in the foreground and print its report.
    Refresh(RefreshArgs),
    /// Print the chunk plan and cache keys for a package.
    Plan(PlanArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CatalogOverride {
    /// Override the catalog file.
    #[arg(long = "catalog-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub catalog: CatalogOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the refresh cron expression.
    #[arg(long = "refresh-schedule", value_name = "CRON")]
    pub refresh_schedule: Option<String>,

    /// Toggle the scheduled refresh.
    #[arg(
        long = "refresh-schedule-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub refresh_schedule_enabled: Option<bool>,

    /// Override the number of concurrent upstream fetches.
    #[arg(long = "refresh-concurrency", value_name = "COUNT")]
    pub refresh_concurrency: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RefreshScopeArg {
    /// Org downloads, owner stats and every library repository.
    All,
    /// Download history for every catalog package plus owner stats.
    Org,
    /// GitHub stats for every library repository.
    Libraries,
    /// Download history for the packages named with `--package`.
    Packages,
}

#[derive(Debug, Args, Clone)]
pub struct RefreshArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub catalog: CatalogOverride,

    /// What to refresh.
    #[arg(long, value_enum, default_value_t = RefreshScopeArg::All)]
    pub scope: RefreshScopeArg,

    /// Package to refresh; repeat for several. Required with `--scope packages`.
    #[arg(long = "package", value_name = "NAME")]
    pub packages: Vec<String>,

    /// Refetch the live chunk even when its entry is still fresh.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub catalog: CatalogOverride,

    /// Package whose chunk plan is printed.
    #[arg(value_name = "PACKAGE")]
    pub package: String,

    /// Plan as of this day (YYYY-MM-DD); defaults to today.
    #[arg(long = "as-of", value_name = "DATE")]
    pub as_of: Option<String>,
}
