//! Drill server
//!
//! Loads configuration, opens the database and serves the HTTP API.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use drill_core::{create_router, AppState, Config, API_KEY_ENV};
use drill_llm::AnthropicClient;
use drill_store::{SqliteStore, Store};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Drill - guided practice with LLM feedback
///
/// Serves exercise modules, evaluates learner answers with an LLM and tracks
/// each learner's progress through a module.
#[derive(Parser, Debug)]
#[command(name = "drill")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: drill.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Port for the HTTP API server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the SQLite database (overrides config)
    #[arg(short, long, value_name = "FILE")]
    database: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Drill starting");
    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.apply_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ref database) = args.database {
        config.database.path.clone_from(database);
    }
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    print_config(&config);

    let Some(api_key) = config.llm.api_key.clone() else {
        anyhow::bail!(
            "No LLM API key configured\n\nSuggestion: Set the {API_KEY_ENV} environment variable"
        );
    };

    let store = SqliteStore::open(
        &config.database.path,
        config.database.pool_config(),
        config.database.statement_timeout(),
    )
    .await
    .map_err(|e| {
        anyhow::anyhow!(
            "Failed to open database '{}': {e}\n\nSuggestion: Check the path and its permissions",
            config.database.path
        )
    })?;
    store.init().await?;
    tracing::info!(path = %config.database.path, "Database ready");

    let provider = AnthropicClient::new(api_key)?
        .with_base_url(config.llm.base_url.clone())
        .with_model(config.llm.model.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, Arc::new(store), Arc::new(provider));
    let router = create_router(state);

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!("HTTP API server running on http://{addr}");
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Drill stopped");
    Ok(())
}

/// Loads configuration from an explicit file or the current directory.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!("  Environment: {:?}", config.environment);
    println!("  Database: {}", config.database.path);
    println!("  Model: {}", config.llm.model);
    println!("  Max retries: {}", config.retry.max_retries);
    println!("  Max hints: {}", config.progression.max_hints);
    match config.progression.max_attempts_per_exercise {
        Some(max) => println!("  Max attempts per exercise: {max}"),
        None => println!("  Max attempts per exercise: unlimited"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
