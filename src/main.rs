use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use almanac::{
    application::{
        coordinator::{BudgetPolicy, GenerationCoordinator, LockPolicy},
        error::AppError,
        gate::{RatePolicy, RequestGate},
        geometry::GeometryStore,
        library::Library,
        narrative::NarrativeCache,
        ports::{GeometryEngine, NarrativeGenerator},
        prompt::PromptBuilder,
        repos::{BooksRepo, CoordinationStore},
    },
    config::{self, CoordinationBackend},
    domain::{BookKey, RawInput, normalize},
    infra::{
        db::PostgresRepositories,
        engine::HttpGeometryEngine,
        error::InfraError,
        http::{self, ApiState},
        llm::ChatCompletionsGenerator,
        memory::{InMemoryBooks, InMemoryCoordination},
        telemetry,
    },
};
use serde_json::json;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
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
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    // `key` prints JSON to stdout; keep log output out of it.
    if !matches!(command, config::Command::Key(_)) {
        telemetry::init(&settings.logging).map_err(AppError::from)?;
    }

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
        config::Command::Key(args) => run_key(&settings, args),
    }
}

fn run_key(settings: &config::Settings, args: config::KeyArgs) -> Result<(), AppError> {
    let raw: RawInput = serde_json::from_str(&args.input)
        .map_err(|err| AppError::unexpected(format!("input is not valid JSON: {err}")))?;
    let normalized = normalize(&raw).map_err(|err| AppError::unexpected(err.to_string()))?;

    let mut engine = settings.engine.config.clone();
    if let Some(version) = args.schema_version {
        engine = engine.with_schema_version(version);
    }
    let key = BookKey::derive(&normalized, &engine);

    let report = json!({
        "library": normalized.library(),
        "normalized": normalized,
        "engine": engine,
        "book_key": key,
    });
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(database_url, 1)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    info!(target: "almanac::migrate", "migrations applied");
    Ok(())
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Option<Arc<PostgresRepositories>>, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        return Ok(None);
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Some(Arc::new(PostgresRepositories::new(pool))))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let db = init_repositories(&settings).await?;

    let books: Arc<dyn BooksRepo> = match db.as_ref() {
        Some(db) => db.clone(),
        None => {
            warn!(
                target: "almanac::serve",
                "database url is not configured; books are kept in memory and lost on restart"
            );
            Arc::new(InMemoryBooks::new())
        }
    };

    let (coordination, sweeper): (Arc<dyn CoordinationStore>, JoinHandle<()>) =
        match (settings.coordination.backend, db.as_ref()) {
            (CoordinationBackend::Postgres, Some(db)) => {
                let store: Arc<dyn CoordinationStore> = db.clone();
                let sweeper =
                    spawn_postgres_sweeper(db.clone(), settings.coordination.sweep_interval);
                (store, sweeper)
            }
            (CoordinationBackend::Postgres, None) => {
                return Err(InfraError::configuration(
                    "postgres coordination requires a database url",
                )
                .into());
            }
            (CoordinationBackend::Memory, _) => {
                let memory = Arc::new(InMemoryCoordination::new());
                let sweeper =
                    spawn_memory_sweeper(memory.clone(), settings.coordination.sweep_interval);
                let store: Arc<dyn CoordinationStore> = memory;
                (store, sweeper)
            }
        };

    let engine: Arc<dyn GeometryEngine> = Arc::new(HttpGeometryEngine::new(
        settings.engine.endpoint.clone(),
        settings.engine.timeout,
    )?);
    if settings.generation.api_key.is_none() {
        warn!(
            target: "almanac::serve",
            endpoint = %settings.generation.endpoint,
            "generation api key is not configured"
        );
    }
    // The client timeout sits just above the coordinator's so the coordinator
    // reports the timeout first.
    let generator: Arc<dyn NarrativeGenerator> = Arc::new(ChatCompletionsGenerator::new(
        settings.generation.endpoint.clone(),
        settings.generation.model.clone(),
        settings.generation.api_key.clone(),
        settings.generation.timeout + Duration::from_secs(1),
    )?);

    let library = build_library(&settings, books, coordination, engine, generator);
    let state = ApiState {
        library: Arc::new(library),
        engine: settings.engine.config.clone(),
        prompt_version: settings.narrative.prompt_version,
        default_language: settings.narrative.default_language.clone(),
        db,
    };

    let result = serve_http(&settings, state).await;

    sweeper.abort();
    let _ = sweeper.await;

    result
}

fn build_library(
    settings: &config::Settings,
    books: Arc<dyn BooksRepo>,
    coordination: Arc<dyn CoordinationStore>,
    engine: Arc<dyn GeometryEngine>,
    generator: Arc<dyn NarrativeGenerator>,
) -> Library {
    let gate = RequestGate::new(
        coordination.clone(),
        RatePolicy::from(&settings.rate_limit),
    );
    let coordinator = GenerationCoordinator::new(
        coordination,
        generator,
        BudgetPolicy::from(&settings.budget),
        LockPolicy::from(&settings.locks),
        settings.generation.timeout,
    );
    let prompts = PromptBuilder::new(
        settings.narrative.rules.clone(),
        settings.generation.max_output_tokens.get(),
    );

    Library::new(
        GeometryStore::new(books.clone(), engine),
        NarrativeCache::new(books, coordinator, gate, prompts),
    )
}

fn spawn_memory_sweeper(store: Arc<InMemoryCoordination>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            debug!(target: "almanac::sweeper", removed, "expired coordination entries purged");
        }
    })
}

fn spawn_postgres_sweeper(db: Arc<PostgresRepositories>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match db.purge_expired_coordination().await {
                Ok(removed) => {
                    debug!(
                        target: "almanac::sweeper",
                        removed,
                        "expired coordination entries purged"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "almanac::sweeper",
                        error = %err,
                        "failed to purge coordination entries"
                    );
                }
            }
        }
    })
}

async fn serve_http(settings: &config::Settings, state: ApiState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target: "almanac::serve", addr = %settings.server.addr, "listening");

    let stopping = Arc::new(Notify::new());
    let signal = stopping.clone();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            signal.notify_one();
        },
    );

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        stopping.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(
                target: "almanac::serve",
                grace_seconds = grace.as_secs(),
                "in-flight requests did not finish before the shutdown deadline"
            );
        }
    }

    info!(target: "almanac::serve", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!(target: "almanac::serve", "shutdown signal received");
}
