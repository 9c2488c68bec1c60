#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod actor;
mod cache;
mod chunker;
mod config;
mod daemon;
mod embedding;
mod error;
mod foundation;
mod git;
mod ipc;
mod storage;
mod sync;
mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ipc::client::{call_resilient, DaemonClient};

#[derive(Parser)]
#[command(name = "cortex")]
#[command(about = "Branch-aware source indexing daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the current (or given) project with the indexer daemon.
    Register {
        #[arg(long)]
        path: Option<String>,
    },

    /// Trigger indexing for a project; full sync unless `--paths` is given.
    Index {
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        paths: Vec<String>,
    },

    /// Show a project's indexing status.
    Status {
        #[arg(long)]
        path: Option<String>,
    },

    /// Stream the indexer daemon's logs.
    Logs {
        #[arg(long)]
        project: Option<String>,
    },

    /// Shut down the indexer daemon.
    Stop,

    /// Check the embedding daemon's health.
    EmbedHealth,

    /// (internal) Run the indexer daemon in the foreground.
    #[command(name = "__indexer-daemon", hide = true)]
    IndexerDaemon,

    /// (internal) Run the embedding daemon in the foreground.
    #[command(name = "__embed-daemon", hide = true)]
    EmbedDaemon {
        #[arg(long)]
        socket: Option<String>,
    },
}

fn init_tracing() {
    let text_logging = std::env::var("CORTEX_LOG_TEXT").map(|v| v == "1" || v == "true").unwrap_or(false);
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "cortex=info".into());

    if text_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::IndexerDaemon => run_indexer_daemon(),
        Commands::EmbedDaemon { socket } => run_embed_daemon(socket.map(PathBuf::from)),
        other => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_client_command(other))
        }
    }
}

// === Indexer daemon entry point ===

fn run_indexer_daemon() -> anyhow::Result<()> {
    let global = config::load_global()?;
    std::fs::create_dir_all(&global.cache_base_dir)?;

    let num_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads((num_cpus / 2).max(4))
        .max_blocking_threads(num_cpus)
        .thread_name("cortex-worker")
        .enable_all()
        .build()?;

    rt.block_on(async {
        init_tracing();
        tracing::info!("indexer daemon starting (pid {})", std::process::id());

        let socket_path = global.indexer_daemon.socket_path.clone();
        let guard = match foundation::bind_singleton(&socket_path).await {
            Ok(g) => g,
            Err(foundation::SingletonError::AlreadyRunning(_)) => {
                tracing::info!("another indexer daemon already owns {}", socket_path.display());
                return Ok(());
            }
            Err(e) => anyhow::bail!("failed to bind indexer socket: {e}"),
        };

        let daemon_exe = std::env::current_exe()?;
        let state = Arc::new(daemon::state::DaemonState::new(global, daemon_exe).await?);
        let handler = Arc::new(daemon::server::IndexerHandler::new(state.clone()));
        let shutdown = state.shutdown.clone();

        if let Some(addr) = state.global.metrics_addr.clone() {
            let metrics = state.metrics.clone();
            let metrics_shutdown = shutdown.clone();
            tokio::spawn(async move {
                daemon::metrics_http::serve_metrics(&addr, metrics, metrics_shutdown).await;
            });
        }

        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("failed to register SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
            }
            signal_shutdown.cancel();
        });

        ipc::server::run(guard, handler, shutdown).await
    })
}

// === Embedding daemon entry point ===

fn run_embed_daemon(socket_override: Option<PathBuf>) -> anyhow::Result<()> {
    let global = config::load_global()?;
    let socket_path = socket_override.unwrap_or_else(|| global.embed_daemon.socket_path.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        init_tracing();
        tracing::info!("embedding daemon starting (pid {})", std::process::id());

        let guard = match foundation::bind_singleton(&socket_path).await {
            Ok(g) => g,
            Err(foundation::SingletonError::AlreadyRunning(_)) => {
                tracing::info!("another embedding daemon already owns {}", socket_path.display());
                return Ok(());
            }
            Err(e) => anyhow::bail!("failed to bind embedding socket: {e}"),
        };

        let model = config::EmbeddingConfig::default().model;
        let cache_dir = global.cache_base_dir.join("models");
        let handler = Arc::new(embedding::daemon::EmbedHandler::new(model, cache_dir));
        handler.spawn_idle_watch(Duration::from_secs(global.embed_idle_timeout_secs));
        let shutdown = handler.shutdown.clone();

        ipc::server::run(guard, handler, shutdown).await
    })
}

// === Client commands ===

async fn run_client_command(command: Commands) -> anyhow::Result<()> {
    let global = config::load_global()?;
    let exe = std::env::current_exe()?;
    let ensure_timeout = Duration::from_secs(global.ensure_timeout_secs);
    let sock = global.indexer_daemon.socket_path.clone();
    let start_args = vec!["__indexer-daemon".to_string()];

    match command {
        Commands::Register { path } => {
            let p = resolve_path(path)?;
            let result = call_resilient(&sock, exe, start_args, ensure_timeout, "register", json!({ "path": p })).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Index { path, paths } => {
            let p = resolve_path(path)?;
            let result = call_resilient(
                &sock,
                exe,
                start_args,
                ensure_timeout,
                "index",
                json!({ "path": p, "paths": paths }),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status { path } => {
            let p = resolve_path(path)?;
            let result = call_resilient(&sock, exe, start_args, ensure_timeout, "status", json!({ "path": p })).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Logs { project } => {
            if !DaemonClient::is_alive(&sock).await {
                anyhow::bail!("indexer daemon is not running");
            }
            let mut client = DaemonClient::connect(&sock).await?;
            client.call("stream_logs", json!({ "project": project })).await?;
            while let Some(line) = client.read_line().await? {
                println!("{}", line);
            }
        }
        Commands::Stop => {
            if !DaemonClient::is_alive(&sock).await {
                println!("indexer daemon is not running");
                return Ok(());
            }
            let mut client = DaemonClient::connect(&sock).await?;
            let _ = client.call("shutdown", json!({})).await?;
            println!("shutdown requested");
        }
        Commands::EmbedHealth => {
            let embed_sock = global.embed_daemon.socket_path.clone();
            if !DaemonClient::is_alive(&embed_sock).await {
                println!("{{\"healthy\":false}}");
                std::process::exit(1);
            }
            let mut client = DaemonClient::connect(&embed_sock).await?;
            let result = client.call("health", json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::IndexerDaemon | Commands::EmbedDaemon { .. } => unreachable!(),
    }

    Ok(())
}

fn resolve_path(path: Option<String>) -> anyhow::Result<String> {
    let resolved = match path {
        Some(p) => PathBuf::from(p),
        None => std::env::current_dir()?,
    };
    Ok(resolved.canonicalize()?.to_string_lossy().to_string())
}
