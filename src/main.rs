mod config;
mod error;
mod model;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::Config;
use crate::session::GenerationCoordinator;
use crate::session::coordinator::CoordinatorOptions;

/// How long process exit waits for generation tasks that ignored their
/// stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() {
    // Load .env file (if present) before anything reads env vars
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", Config::default_config_contents());
        return;
    }

    // Initialize tracing (RUST_LOG, then LOG_LEVEL, then info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .filter(|level| !level.trim().is_empty())
                .and_then(|level| {
                    tracing_subscriber::EnvFilter::try_new(level.trim().to_lowercase()).ok()
                })
        })
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load config
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return;
        }
    };

    let check_only = args.iter().any(|a| a == "--check");
    runtime.block_on(run(config, check_only));

    // Generation tasks that never observed their stop signal must not keep
    // the process alive.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

async fn run(config: Config, check_only: bool) {
    info!(
        bind = %config.bind,
        backend = %config.model.backend,
        model = %config.model.name,
        "stream-infer starting"
    );

    // Load the model once; the server only starts when it is ready.
    let load_config = config.clone();
    let gateway = match tokio::task::spawn_blocking(move || model::load(&load_config)).await {
        Ok(Ok(g)) => g,
        Ok(Err(e)) => {
            error!("failed to load model: {e}");
            return;
        }
        Err(e) => {
            error!("model loading task failed: {e}");
            return;
        }
    };

    if check_only {
        println!(
            "model ready: backend={} model={} context_window={}",
            gateway.name(),
            gateway.model(),
            gateway.context_window()
        );
        release_on_blocking_pool(gateway).await;
        return;
    }

    let coordinator = Arc::new(GenerationCoordinator::new(
        gateway,
        CoordinatorOptions::from(&config),
    ));

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("failed to listen for ctrl-c: {e}"),
        }
    });

    if let Err(e) = server::serve(&config, Arc::clone(&coordinator), shutdown_rx).await {
        error!("server error: {e}");
    }

    coordinator.stop_all().await;
    release_on_blocking_pool(coordinator).await;
    info!("stream-infer stopped");
}

/// Drop the last reference to something that owns the gateway.  Blocking
/// HTTP clients may not be dropped on an async worker thread.
async fn release_on_blocking_pool<T: Send + 'static>(value: T) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(value)).await {
        error!("failed to release model gateway: {e}");
    }
}

fn print_usage() {
    println!(
        "stream-infer - streaming inference front-end

USAGE:
    stream-infer [OPTIONS]

OPTIONS:
    --config <PATH>     Config file (default: $XDG_CONFIG_HOME/stream-infer/config.toml)
    --default-config    Print the example config and exit
    --check             Load the model, report readiness and exit
    -h, --help          Show this help

ENVIRONMENT:
    MODEL_NAME_OR_PATH  Model to serve
    MODEL_PROVIDER      \"local\" forbids fetching missing weights
    OLLAMA_HOST         Inference server base URL
    BIND_ADDR, PORT     Listen address / port
    LOG_LEVEL           Log level when RUST_LOG is unset (default: info)"
    );
}
