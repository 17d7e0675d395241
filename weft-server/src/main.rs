//! Weft dev server binary.
//!
//! `weft serve` runs the discovery-and-reload pipeline behind the HTTP
//! control API and the hot-reload WebSocket; `weft build` compiles every
//! discovered component once and exits with a CI-friendly status code.

mod errors;
mod handlers;
mod orchestrator;
mod reload;
mod routes;
mod state;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_config::WeftConfig;
use weft_core::{BuildPriority, BuildStatus, Severity};

use state::AppState;

const EXIT_FAILURE: i32 = 1;
// Exit code 2 is invalid usage; clap produces it on its own.
const EXIT_CONFIG: i32 = 3;
const EXIT_COMPILE: i32 = 4;

#[derive(Parser)]
#[command(name = "weft", version, about = "Dev engine for typed HTML templates")]
struct Cli {
    /// Configuration file (defaults to probing weft.yaml in the project)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch, rebuild, and push reload events (the default)
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Compile every discovered component once and exit
    Build,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft=info,weft_server=info,weft_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> i32 {
    let (mut config, source) = match WeftConfig::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(error) => {
            error!(%error, "configuration error");
            return EXIT_CONFIG;
        }
    };
    info!(?source, "configuration loaded");

    let root = match cli.root.or_else(|| std::env::current_dir().ok()) {
        Some(root) => root,
        None => {
            error!("could not determine the project root");
            return EXIT_FAILURE;
        }
    };

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        host: None,
    }) {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Err(error) = config.validate() {
                error!(%error, "configuration error");
                return EXIT_CONFIG;
            }
            match serve(config, root).await {
                Ok(()) => 0,
                Err(error) => {
                    error!(%error, "server failed");
                    EXIT_FAILURE
                }
            }
        }
        Commands::Build => build(config, root).await,
    }
}

async fn serve(config: WeftConfig, root: PathBuf) -> anyhow::Result<()> {
    let bind = (config.server.host.clone(), config.server.port);
    let state = AppState::initialize(config, &root).await?;

    let ctx = CancellationToken::new();
    state.plugins.initialize_all().await;
    state.plugins.start_health_task(ctx.clone()).await;
    let orchestrator = orchestrator::start(&state, &ctx).await?;

    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, root = %state.project.root().display(), "weft dev server listening");

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_ctx.cancel();
        })
        .await?;

    // Teardown order mirrors the data flow: stop producing changes, drain
    // the pools, then close the clients.
    ctx.cancel();
    orchestrator.shutdown().await;
    state.scanner.close().await;
    state.build_pool.shutdown().await;
    state.plugins.shutdown_all().await;
    state.hub.shutdown();
    Ok(())
}

async fn build(config: WeftConfig, root: PathBuf) -> i32 {
    let state = match AppState::initialize(config, &root).await {
        Ok(state) => state,
        Err(error) => {
            error!(%error, "failed to initialize");
            return EXIT_FAILURE;
        }
    };

    for path in &state.config.scanner.paths {
        let dir = if path.is_absolute() {
            path.clone()
        } else {
            state.project.root().join(path)
        };
        if !dir.is_dir() {
            continue;
        }
        if let Err(error) = state.scanner.scan_directory(&dir).await {
            error!(%error, "scan failed");
            return EXIT_FAILURE;
        }
    }

    let components = state.registry.get_all();
    info!(count = components.len(), "building discovered components");
    state.plugins.pre_build(&components).await;

    let mut receivers = Vec::new();
    for component in &components {
        match state
            .build_pool
            .submit(Arc::clone(component), BuildPriority::User)
            .await
        {
            Ok(receiver) => receivers.push(receiver),
            Err(error) => {
                error!(component = %component.name, %error, "build submission failed");
                return EXIT_FAILURE;
            }
        }
    }

    let mut results = Vec::new();
    let (mut compile_failures, mut transport_failures) = (0usize, 0usize);
    for receiver in receivers {
        let Ok(result) = receiver.await else {
            transport_failures += 1;
            continue;
        };
        match result.status {
            BuildStatus::Succeeded => {}
            BuildStatus::FailedCompile => {
                compile_failures += 1;
                for diag in &result.parsed_errors {
                    let severity = match diag.severity {
                        Severity::Error => "error",
                        Severity::Warning => "warning",
                        Severity::Note => "note",
                    };
                    eprintln!(
                        "{}:{}:{}: {severity}: {}",
                        diag.file, diag.line, diag.column, diag.message
                    );
                }
            }
            BuildStatus::FailedTransport | BuildStatus::Cancelled => transport_failures += 1,
        }
        results.push(result);
    }
    state.plugins.post_build(&components, &results).await;

    state.scanner.close().await;
    state.build_pool.shutdown().await;

    if compile_failures > 0 {
        error!(compile_failures, "build finished with compile errors");
        EXIT_COMPILE
    } else if transport_failures > 0 {
        error!(transport_failures, "build finished with transport failures");
        EXIT_FAILURE
    } else {
        info!("build succeeded");
        0
    }
}
