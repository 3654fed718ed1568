// crates/orchestrator-cli/src/main.rs
// ============================================================================
// Module: Pipeline Orchestrator CLI Entry Point
// Description: Command dispatcher for the HTTP API and worker loop.
// Purpose: Provide a single binary that can run the worker alone, or the
//          worker and HTTP API together.
// Dependencies: clap, orchestrator-core, orchestrator-http, orchestrator-worker, tokio
// ============================================================================

//! ## Overview
//! `serve` runs the HTTP API and the worker loop concurrently inside one
//! process; `worker` runs the worker loop alone, with no HTTP surface. Both
//! subcommands share one `SqliteStore` and shut down on `Ctrl+C`, letting
//! the in-flight tick (one transaction) finish before exiting.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use orchestrator_adapters::GitHubClient;
use orchestrator_adapters::GitHubConfig;
use orchestrator_adapters::HttpRoleDispatcher;
use orchestrator_adapters::PatternSecretScanner;
use orchestrator_adapters::StubRoleDispatcher;
use orchestrator_config::Config;
use orchestrator_config::ConfigError;
use orchestrator_core::RoleDispatcher;
use orchestrator_core::Store;
use orchestrator_handlers::HandlerDeps;
use orchestrator_http::AppState;
use orchestrator_store_sqlite::SqliteStore;
use orchestrator_worker::Scheduler;
use orchestrator_worker::StdoutSink;
use orchestrator_worker::TickSink;
use orchestrator_worker::worker_loop;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "orchestrator", arg_required_else_help = true)]
struct Cli {
    /// Overrides `DATABASE_URL` from the environment.
    #[arg(long, global = true, value_name = "PATH")]
    database_url: Option<String>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API and the worker loop together.
    Serve(ServeCommand),
    /// Run the worker loop alone, with no HTTP surface.
    Worker(WorkerCommand),
}

/// Arguments for the `serve` command.
#[derive(Args, Debug, Default)]
struct ServeCommand {}

/// Arguments for the `worker` command.
#[derive(Args, Debug, Default)]
struct WorkerCommand {}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Top-level CLI errors.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration failed to load.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// The store could not be opened.
    #[error("store error: {0}")]
    Store(String),
    /// An adapter could not be constructed.
    #[error("adapter error: {0}")]
    Adapter(String),
    /// The HTTP listener could not be bound.
    #[error("http bind error: {0}")]
    HttpBind(String),
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = std::io::Write::write_all(&mut std::io::stderr(), format!("orchestrator: {err}\n").as_bytes());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(std::path::Path::new(&config.database_url)).map_err(|err| CliError::Store(err.to_string()))?);
    let dispatcher: Arc<dyn RoleDispatcher> = match &config.llm_endpoint {
        Some(endpoint) => {
            Arc::new(HttpRoleDispatcher::new(endpoint.clone(), 30).map_err(|err| CliError::Adapter(err.to_string()))?)
        }
        None => Arc::new(StubRoleDispatcher),
    };
    let github = Arc::new(
        GitHubClient::new(GitHubConfig { token: config.github_token.clone(), repo: config.github_repo.clone() })
            .map_err(|err| CliError::Adapter(err.to_string()))?,
    );
    let secret_scanner = Arc::new(PatternSecretScanner::new());
    let sink: Arc<dyn TickSink> = Arc::new(StdoutSink);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(wait_for_ctrl_c(shutdown_tx));

    match cli.command {
        Commands::Serve(_) => run_serve(config, store, dispatcher, github, secret_scanner, sink, shutdown_rx).await,
        Commands::Worker(_) => {
            run_worker(config, store, dispatcher, github, secret_scanner, sink, shutdown_rx).await;
            Ok(())
        }
    }
}

async fn wait_for_ctrl_c(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown_tx.send(true);
    }
}

async fn run_worker(
    config: Config,
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn RoleDispatcher>,
    github: Arc<GitHubClient>,
    secret_scanner: Arc<PatternSecretScanner>,
    sink: Arc<dyn TickSink>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let deps = HandlerDeps {
        dispatcher: dispatcher.as_ref(),
        code_hosting: github.as_ref(),
        ci_waiter: github.as_ref(),
        secret_scanner: secret_scanner.as_ref(),
        ci_timeout_seconds: 600,
    };
    let scheduler = Scheduler::new(store.as_ref(), config.max_attempts, sink.as_ref());
    worker_loop(&scheduler, &deps, Duration::from_secs(config.worker_poll_interval_seconds), shutdown_rx).await;
}

async fn run_serve(
    config: Config,
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn RoleDispatcher>,
    github: Arc<GitHubClient>,
    secret_scanner: Arc<PatternSecretScanner>,
    sink: Arc<dyn TickSink>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<(), CliError> {
    let state = AppState::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        github.clone() as Arc<dyn orchestrator_core::CodeHostingClient>,
        github.clone() as Arc<dyn orchestrator_core::CiWaiter>,
        Arc::clone(&secret_scanner) as Arc<dyn orchestrator_core::SecretScanner>,
        Arc::clone(&sink),
        600,
        config.max_attempts,
    );
    let app = orchestrator_http::build_router(state);
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|err| CliError::HttpBind(err.to_string()))?;

    let worker_shutdown = shutdown_rx.clone();
    let worker_handle = tokio::spawn(async move {
        run_worker(config, store, dispatcher, github, secret_scanner, sink, worker_shutdown).await;
    });

    let serve_result = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });
    let http_result = serve_result.await;
    let _ = worker_handle.await;
    http_result.map_err(|err| CliError::HttpBind(err.to_string()))
}
