//! upload-server -- resumable HTTP upload server.
//!
//! Crash-only design: every startup is a recovery. Upload state lives
//! entirely in the upload store and idempotency index, so there is no
//! separate recovery mode. SIGTERM/SIGINT handlers only stop accepting
//! connections and wait with a timeout before exiting.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use resumable_upload::config::{Config, LoggingConfig};
use resumable_upload::engine::UploadEngine;
use resumable_upload::metadata::store::IdempotencyIndex;
use resumable_upload::storage::backend::UploadStore;

/// Command-line arguments for the upload server.
#[derive(Parser, Debug)]
#[command(name = "upload-server", version, about = "Resumable HTTP upload server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "upload-server.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn UploadStore>> {
    let store: Arc<dyn UploadStore> = match config.storage.backend.as_str() {
        "memory" => {
            info!("Memory upload store initialized (uploads do not survive restarts)");
            Arc::new(resumable_upload::storage::memory::MemoryBackend::new())
        }
        "local" => {
            let root = &config.storage.local.root_dir;
            let backend = resumable_upload::storage::local::LocalBackend::new(root)?;
            info!("Local upload store initialized at {}", root);
            Arc::new(backend)
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected 'local' or 'memory')"),
    };
    Ok(store)
}

fn open_index(config: &Config) -> anyhow::Result<Arc<dyn IdempotencyIndex>> {
    let index: Arc<dyn IdempotencyIndex> = match config.idempotency.engine.as_str() {
        "memory" => {
            info!("Memory idempotency index initialized");
            Arc::new(resumable_upload::metadata::memory::MemoryIdempotencyIndex::new())
        }
        "sqlite" => {
            let path = &config.idempotency.sqlite.path;
            // Ensure parent directory exists for the SQLite file.
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let index = resumable_upload::metadata::sqlite::SqliteIdempotencyIndex::new(path)?;
            info!("SQLite idempotency index initialized at {}", path);
            Arc::new(index)
        }
        other => {
            anyhow::bail!("unknown idempotency.engine '{other}' (expected 'sqlite' or 'memory')")
        }
    };
    Ok(index)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resumable_upload::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        resumable_upload::metrics::init_metrics();
        resumable_upload::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let store = open_store(&config)?;
    let index = open_index(&config)?;
    let engine = Arc::new(UploadEngine::new(store, index, &config.server.public_url));
    info!(
        public_url = %config.server.public_url,
        default_version = %config.protocol.default_version,
        "Upload engine ready"
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(resumable_upload::AppState { config, engine });
    let app = resumable_upload::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Upload server listening on {}", bind_addr);

    // Once a signal arrives, in-flight uploads get `shutdown_timeout` to
    // finish. Whatever they wrote so far stays resumable either way.
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(shutdown_timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!("Shutdown timeout elapsed with uploads still in flight");
        }
    }

    info!("Upload server shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
