// =============================================================================
// tickhub — Main Entry Point
// =============================================================================
//
// Startup order: environment, tracing, runtime config, shared state, then the
// background loops (upstream streams, hub liveness, store expiry, rate-limit
// window) and finally the HTTP / WebSocket server. Config is saved on Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tickhub::api;
use tickhub::app_state::AppState;
use tickhub::runtime_config::RuntimeConfig;

const DEFAULT_CONFIG_PATH: &str = "tickhub_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("tickhub starting up");

    let config_path =
        std::env::var("TICKHUB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        kline_intervals = ?config.kline_intervals,
        "Configured streams"
    );

    let bind_addr = config.bind_addr.clone();
    let purge_every = config.store_purge_interval();

    // ── 2. Build shared state ────────────────────────────────────────────
    let admin_token = std::env::var("TICKHUB_ADMIN_TOKEN").ok();
    if admin_token.is_none() {
        warn!("TICKHUB_ADMIN_TOKEN not set, admin routes are disabled");
    }
    let state = Arc::new(
        AppState::new(config)?
            .with_config_path(&config_path)
            .with_admin_token(admin_token),
    );

    // ── 3. Upstream market streams ───────────────────────────────────────
    let streams = state.upstream.spawn();
    info!(count = streams.len(), "Upstream streams launched");

    // ── 4. Hub liveness sweeps ───────────────────────────────────────────
    tokio::spawn(state.hub.clone().run_liveness());

    // ── 5. Store expiry ──────────────────────────────────────────────────
    let store = state.store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = store.len(), "expired cache entries purged");
            }
        }
    });

    // ── 6. Request-weight window ─────────────────────────────────────────
    let rate_limit = state.rate_limit.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            rate_limit.reset_1m_weight();
        }
    });

    // ── 7. HTTP / WebSocket server ───────────────────────────────────────
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening (hub socket at /ws)");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");

    if let Err(e) = state.persist_config() {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("tickhub shut down complete.");
    Ok(())
}
