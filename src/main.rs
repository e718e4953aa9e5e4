//! pdfscope binary — thin CLI shell over the [`pdfscope`] library crate.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::{CommandFactory, Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use pdfscope::api::{self, AppContext};
use pdfscope::builder;
use pdfscope::cache::IndexCache;
use pdfscope::config::{self, DEFAULT_PORT};
use pdfscope::embed;
use pdfscope::reclaim;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Passage retrieval server for PDF-derived document collections.
#[derive(Parser)]
#[command(name = "pdfscope", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Collection directory to serve (default: current directory)
    #[arg(long)]
    collection: Option<PathBuf>,

    /// HTTP port (default 1411; PORT env also honored)
    #[arg(long)]
    port: Option<u16>,

    /// Embedding model identifier (HuggingFace model ID)
    #[arg(long)]
    model: Option<String>,

    /// Skip warming the collection into the cache at startup
    #[arg(long)]
    no_preload: bool,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh a collection's indices
    Build {
        /// Collection directory (default: current directory)
        path: Option<PathBuf>,

        /// Also build one index per source file (for fan-out queries)
        #[arg(long)]
        per_file: bool,

        /// Rebuild even when the existing index is current
        #[arg(long)]
        force: bool,
    },
    /// Remove per-file index directories whose source file is gone
    Reclaim {
        /// Collection directory (default: current directory)
        path: Option<PathBuf>,

        /// Actually delete (default is a dry-run report)
        #[arg(long)]
        apply: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_collection(path: Option<PathBuf>) -> PathBuf {
    let raw = path.unwrap_or_else(|| {
        std::env::current_dir().unwrap_or_else(|e| {
            error!(error = %e, "could not determine current directory");
            std::process::exit(1);
        })
    });
    raw.canonicalize().unwrap_or_else(|e| {
        error!(path = %raw.display(), error = %e, "collection directory not found");
        std::process::exit(1);
    })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pdfscope=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Commands::Build { path, per_file, force } => {
                let root = resolve_collection(path);
                let cfg = config::load(&root).unwrap_or_else(|e| {
                    error!(error = %e, "invalid config file");
                    std::process::exit(1);
                });
                let model = cli.model.as_deref().unwrap_or(&cfg.embedding_model);
                let embedder = embed::global(model).unwrap_or_else(|e| {
                    error!(error = %e, "embedding model unavailable");
                    std::process::exit(1);
                });
                let opts = cfg.build_options();

                let report = builder::build_collection(&root, embedder.as_ref(), &opts, force)
                    .unwrap_or_else(|e| {
                        error!(error = %e, "collection build failed");
                        std::process::exit(1);
                    });
                for warning in &report.warnings {
                    warn!(warning = warning.as_str(), "build warning");
                }
                info!(
                    built = report.built,
                    chunks = report.manifest.chunks,
                    elapsed_s = format!("{:.1}", report.elapsed_seconds).as_str(),
                    "collection index ready"
                );

                if per_file {
                    let shards = builder::build_per_file(&root, embedder.as_ref(), &opts)
                        .unwrap_or_else(|e| {
                            error!(error = %e, "per-file build failed");
                            std::process::exit(1);
                        });
                    info!(built = shards.built, reused = shards.reused, "per-file indices ready");
                }
                return;
            }
            Commands::Reclaim { path, apply } => {
                let root = resolve_collection(path);
                let report = reclaim::reclaim(&root, !apply).unwrap_or_else(|e| {
                    error!(error = %e, "reclamation failed");
                    std::process::exit(1);
                });
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
                if !report.errors.is_empty() {
                    std::process::exit(1);
                }
                return;
            }
            Commands::Completions { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Cli::command(),
                    "pdfscope",
                    &mut std::io::stdout(),
                );
                return;
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Serve mode
    // ---------------------------------------------------------------------------

    let collection = resolve_collection(cli.collection);
    let mut cfg = config::load(&collection).unwrap_or_else(|e| {
        error!(error = %e, "invalid config file");
        std::process::exit(1);
    });
    if let Some(model) = cli.model {
        cfg.embedding_model = model;
    }
    if cli.no_preload {
        cfg.preload = false;
    }

    // The model is the service's one heavy dependency; load it up front so a
    // broken setup fails fast with a non-zero exit instead of on first query.
    let embedder = embed::global(&cfg.embedding_model).unwrap_or_else(|e| {
        error!(error = %e, "embedding model unavailable");
        std::process::exit(1);
    });

    let cache = Arc::new(IndexCache::new(embedder, cfg.build_options()));
    let ctx = AppContext {
        cache: Arc::clone(&cache),
        config: Arc::new(cfg.clone()),
        collection: collection.clone(),
    };

    if cfg.preload {
        info!(path = %collection.display(), "preloading collection");
        match cache.get_or_load(&collection).await {
            Ok((entry, _)) => info!(
                docs = entry.doc_count(),
                chunks = entry.index.len(),
                load_s = format!("{:.1}", entry.load_seconds).as_str(),
                "collection preloaded"
            ),
            Err(e) => warn!(error = %e, "preload failed, first query will retry"),
        }
    }

    let app = Router::new()
        .route("/", get(api::api_root))
        .route("/cache/stats", get(api::api_cache_stats))
        .route("/query", post(api::api_query))
        .route("/multi_query", post(api::api_multi_query))
        .route("/cache/{*path}", delete(api::api_evict))
        .route("/cache", delete(api::api_evict_all))
        .route("/cache/reload", post(api::api_reload))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let port = cli
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT);

    let listener = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}"))
        .await
        .unwrap_or_else(|e| {
            error!(port = port, error = %e, "could not bind to port");
            std::process::exit(1);
        });

    info!(port = port, collection = %collection.display(), "http://localhost:{port}");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();
}
