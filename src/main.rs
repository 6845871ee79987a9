use std::{future::IntoFuture, num::NonZeroUsize, process, sync::Arc};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::{CronStream, Schedule};
use libstats::{
    application::{
        error::AppError,
        jobs::{
            JobWorkerContext, RefreshSupervisor, process_refresh_stats_job, refresh_stats_schedule,
        },
        refresh::{RefreshConfig, RefreshOptions, RefreshOrchestrator, RefreshScope},
        stats::StatsService,
        upstream::UpstreamClient,
    },
    cache::{CacheBackend, CacheConfig, CacheKey, CacheStore, MemoryBackend, SystemClock},
    config,
    domain::{catalog::Catalog, chunks::generate_chunks, types::parse_date},
    infra::{
        catalog::load_catalog,
        db::PostgresStore,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        upstream::HttpUpstreamClient,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Refresh(args) => run_refresh(settings, args).await,
        config::Command::Plan(args) => run_plan(settings, args),
    }
}

/// Shared services built from settings.
struct Runtime {
    catalog: Arc<Catalog>,
    store: Arc<CacheStore>,
    orchestrator: Arc<RefreshOrchestrator>,
    db: Option<PostgresStore>,
}

async fn build_runtime(settings: &config::Settings) -> Result<Runtime, AppError> {
    let catalog = Arc::new(load_catalog(&settings.catalog.path)?);
    let (backend, db) = init_backend(settings).await?;
    let store = Arc::new(CacheStore::new(
        backend,
        Arc::new(SystemClock),
        CacheConfig::from(&settings.cache),
    ));
    let upstream: Arc<dyn UpstreamClient> =
        Arc::new(HttpUpstreamClient::new(settings.upstream.clone())?);
    let orchestrator = Arc::new(RefreshOrchestrator::new(
        store.clone(),
        upstream,
        catalog.clone(),
        RefreshConfig::from(&settings.refresh),
    ));

    info!(
        org = %catalog.org,
        libraries = catalog.libraries.len(),
        packages = catalog.all_packages().len(),
        backend = store.backend_name(),
        "runtime initialised"
    );

    Ok(Runtime {
        catalog,
        store,
        orchestrator,
        db,
    })
}

async fn init_backend(
    settings: &config::Settings,
) -> Result<(Arc<dyn CacheBackend>, Option<PostgresStore>), AppError> {
    match settings.database.url.as_deref() {
        Some(url) => {
            let pool = PostgresStore::connect(url, settings.database.max_connections.get())
                .await
                .map_err(|err| InfraError::database(format!("failed to connect: {err}")))?;
            PostgresStore::run_migrations(&pool)
                .await
                .map_err(|err| InfraError::database(format!("failed to run migrations: {err}")))?;
            let store = PostgresStore::new(pool);
            Ok((Arc::new(store.clone()), Some(store)))
        }
        None => {
            warn!(
                "no database url configured; cache entries live in process memory and are lost on restart"
            );
            Ok((Arc::new(MemoryBackend::new()), None))
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runtime = build_runtime(&settings).await?;

    let supervisor = RefreshSupervisor::start(
        runtime.orchestrator.clone(),
        non_zero(settings.refresh.background_workers.get()),
        non_zero(settings.refresh.background_queue.get()),
    );

    let schedule_handle = if settings.refresh.schedule_enabled {
        let schedule = refresh_stats_schedule(&settings.refresh.schedule)
            .map_err(|err| AppError::unexpected(err.to_string()))?;
        info!(schedule = %settings.refresh.schedule, "refresh schedule enabled");
        Some(spawn_refresh_schedule(runtime.orchestrator.clone(), schedule))
    } else {
        info!("refresh schedule disabled");
        None
    };

    if settings.refresh.secret.is_none() {
        warn!("refresh.secret is unset; the refresh endpoints will answer 500");
    }

    let state = HttpState {
        stats: Arc::new(StatsService::new(
            runtime.store.clone(),
            runtime.catalog.clone(),
            settings.refresh.chunk_size_days.get(),
        )),
        orchestrator: runtime.orchestrator.clone(),
        supervisor,
        refresh_secret: settings.refresh.secret.as_deref().map(Arc::from),
        db: runtime.db.clone(),
    };

    let result = serve_http(&settings, state).await;
    if let Some(handle) = schedule_handle {
        handle.abort();
    }
    result
}

fn spawn_refresh_schedule(
    orchestrator: Arc<RefreshOrchestrator>,
    schedule: Schedule,
) -> tokio::task::JoinHandle<()> {
    let refresh_worker = WorkerBuilder::new("refresh-stats-worker")
        .data(JobWorkerContext { orchestrator })
        .backend(CronStream::new(schedule))
        .build_fn(process_refresh_stats_job);

    let monitor = Monitor::new().register(refresh_worker);

    tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    })
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .into_future();
    let mut server = std::pin::pin!(server);

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        () = shutdown_signal() => {
            info!(
                grace_secs = settings.server.graceful_shutdown.as_secs(),
                "shutdown signal received; draining connections"
            );
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(settings.server.graceful_shutdown, server).await {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!("graceful shutdown timed out; dropping open connections");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run_refresh(settings: config::Settings, args: config::RefreshArgs) -> Result<(), AppError> {
    let runtime = build_runtime(&settings).await?;
    let scope = RefreshScope::from(args.scope);
    let options = RefreshOptions {
        force: args.force,
        packages: args.packages,
    };

    let report = runtime.orchestrator.refresh(scope, &options).await?;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{rendered}");

    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            timed_out = report.timed_out,
            "refresh finished with failures"
        );
    }
    Ok(())
}

fn run_plan(settings: config::Settings, args: config::PlanArgs) -> Result<(), AppError> {
    let catalog = load_catalog(&settings.catalog.path)?;
    let today = time::OffsetDateTime::now_utc().date();
    let as_of = match args.as_of.as_deref() {
        Some(value) => parse_date(value)?,
        None => today,
    };

    let start = catalog.package_start(&args.package);
    let chunks = generate_chunks(start, as_of, settings.refresh.chunk_size_days.get());
    for chunk in &chunks {
        let state = if chunk.is_immutable(today) {
            "immutable"
        } else {
            "mutable"
        };
        println!(
            "{}\t{}\t{}\t{}",
            chunk.from,
            chunk.to,
            state,
            CacheKey::chunk(&args.package, chunk)
        );
    }
    info!(
        package = %args.package,
        chunks = chunks.len(),
        %start,
        %as_of,
        "chunk plan printed"
    );
    Ok(())
}

fn non_zero(value: u32) -> NonZeroUsize {
    NonZeroUsize::new(value as usize).unwrap_or(NonZeroUsize::MIN)
}
