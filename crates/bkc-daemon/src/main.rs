//! bkc-daemon entry point.
//!
//! Thin: sets up tracing, loads config, boots the store and engine, wires
//! middleware, and serves until ctrl-c. Background loops get a shutdown
//! signal and run their final flush before the process exits.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use bkc_config::{load_layered_yaml, load_layered_yaml_from_strings, resolve_secrets, BkcConfig};
use bkc_daemon::{routes, state};
use bkc_db::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use bkc_tap::{spawn_flush_ticker, spawn_stream_worker, EngineMode};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

/// Comma-separated YAML paths, merged in order.
const ENV_CONFIG_PATHS: &str = "BKC_CONFIG";
const ENV_DAEMON_ADDR: &str = "BKC_DAEMON_ADDR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = load_config()?;
    let secrets = resolve_secrets(&cfg, |k| std::env::var(k).ok())?;

    let (store, storage): (Arc<dyn LedgerStore>, &'static str) = match &secrets.database_url {
        Some(url) => {
            let pool = bkc_db::connect(url, cfg.database.max_connections).await?;
            bkc_db::migrate(&pool).await?;
            (Arc::new(PgLedgerStore::new(pool)), "postgres")
        }
        None => {
            warn!(
                env = %cfg.database.url_env,
                "no database url; using the in-memory store, balances are lost on exit"
            );
            (Arc::new(MemoryLedgerStore::new()), "memory")
        }
    };
    if secrets.admin_token.is_none() {
        info!(env = %cfg.daemon.admin_token_env, "no admin token; admin routes disabled");
    }

    let booted = state::boot(&cfg, store, None, storage, secrets.admin_token.clone()).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = Vec::new();
    let engine = booted.state.engine.clone();
    if engine.mode() == EngineMode::LocalBuffered {
        tasks.push(spawn_flush_ticker(
            engine.clone(),
            Duration::from_millis(cfg.engine.flush_interval_ms),
            shutdown_rx.clone(),
        ));
    }
    if let Some(worker) = booted.worker.clone() {
        tasks.push(spawn_stream_worker(
            worker,
            Duration::from_millis(cfg.engine.worker_block_ms.max(1)),
            shutdown_rx.clone(),
        ));
    }

    let app = routes::build_router(Arc::clone(&booted.state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env()
        .or_else(|| cfg.daemon.bind_addr.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!(mode = engine.mode().as_str(), storage, "bkc-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    info!("shutting down; flushing buffered taps");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    if let Err(e) = engine.flush().await {
        warn!(error = %e, "final flush failed; pending taps were not made durable");
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_config() -> anyhow::Result<BkcConfig> {
    let loaded = match std::env::var(ENV_CONFIG_PATHS) {
        Ok(raw) if !raw.trim().is_empty() => {
            let paths: Vec<&str> = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            load_layered_yaml(&paths)?
        }
        _ => load_layered_yaml_from_strings(&[])?,
    };
    info!(config_hash = %loaded.config_hash, "config loaded");
    BkcConfig::from_loaded(&loaded)
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(ENV_DAEMON_ADDR).ok()?.parse().ok()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; shutting down");
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
