// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` except the hub socket at `/ws`. Health,
// stats, last-value and market pulls are public; `/api/v1/admin/*` requires
// the `AuthBearer` extractor.
//
// Market pulls go through the request cache, so bursts of identical calls
// cost one exchange request per TTL.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::cache::{CacheKey, ThresholdConfig, ThresholdOverride};
use crate::types::{now_ms, ChannelKey, DataKind, KLINE_INTERVALS};

/// Depth limits accepted by `/fapi/v1/depth`.
const DEPTH_LIMITS: &[u32] = &[5, 10, 20, 50, 100, 500, 1000];
const MAX_KLINES_LIMIT: u32 = 1500;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/last/:kind/:symbol", get(last_value))
        .route("/api/v1/market/ticker/:symbol", get(market_ticker))
        .route("/api/v1/market/klines/:symbol", get(market_klines))
        .route("/api/v1/market/depth/:symbol", get(market_depth))
        .route("/api/v1/market/mark/:symbol", get(market_mark))
        // ── Authenticated ───────────────────────────────────────────
        .route(
            "/api/v1/admin/thresholds",
            get(get_thresholds).put(put_thresholds),
        )
        // ── Hub socket ──────────────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

fn normalize_symbol(raw: &str) -> Result<String, Response> {
    let sym = raw.trim().to_uppercase();
    if sym.is_empty() || !sym.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid symbol '{raw}'"),
        ));
    }
    Ok(sym)
}

// =============================================================================
// Health / stats (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    open_connections: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        open_connections: state.hub.stats().open_connections,
        server_time: now_ms(),
    };
    Json(resp)
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "uptime_secs": state.uptime_secs(),
        "hub": state.hub.stats(),
        "threshold_cache": state.threshold_cache.stats(),
        "request_cache": state.request_cache.stats(),
        "pipeline": state.pipeline.stats(),
        "upstream": state.upstream.stats(),
        "rate_limit": state.rate_limit.snapshot(),
        "store_entries": state.store.len(),
        "recent_errors": state.errors.recent(),
    }))
}

// =============================================================================
// Last accepted value (public)
// =============================================================================

#[derive(Deserialize)]
struct LastQuery {
    interval: Option<String>,
}

async fn last_value(
    State(state): State<Arc<AppState>>,
    Path((kind, symbol)): Path<(String, String)>,
    Query(query): Query<LastQuery>,
) -> Response {
    let kind: DataKind = match kind.parse() {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let channel = match ChannelKey::new(kind, &symbol, query.interval.as_deref()) {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.threshold_cache.get(&channel).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("no value cached for {channel}"),
        ),
        Err(e) => {
            warn!(channel = %channel, error = %e, "last-value lookup failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// =============================================================================
// Market pulls (public, request-cached)
// =============================================================================

async fn cached_pull<T, F, Fut>(state: &AppState, key: CacheKey, ttl_ms: u64, fetch: F) -> Response
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let ttl = Duration::from_millis(ttl_ms);
    match state.request_cache.get_or_fetch(&key, ttl, fetch).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            warn!(key = %key, error = %e, "market pull failed");
            error_response(StatusCode::BAD_GATEWAY, format!("{e:#}"))
        }
    }
}

async fn market_ticker(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    let symbol = match normalize_symbol(&symbol) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let settings = state.config.read().request_cache.clone();
    let key = CacheKey::new(&settings.key_prefix, "ticker", &symbol);
    let client = state.binance.clone();
    cached_pull(&state, key, settings.ticker_ttl_ms, || async move {
        client.ticker_24hr(&symbol).await
    })
    .await
}

#[derive(Deserialize)]
struct KlinesQuery {
    interval: Option<String>,
    limit: Option<u32>,
}

async fn market_klines(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<KlinesQuery>,
) -> Response {
    let symbol = match normalize_symbol(&symbol) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let interval = query.interval.unwrap_or_else(|| "1m".to_string());
    if !KLINE_INTERVALS.contains(&interval.as_str()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported interval '{interval}'"),
        );
    }
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_KLINES_LIMIT);

    let settings = state.config.read().request_cache.clone();
    let key = CacheKey::new(&settings.key_prefix, "klines", &symbol)
        .with_param("interval", &interval)
        .with_param("limit", limit);
    let client = state.binance.clone();
    cached_pull(&state, key, settings.klines_ttl_ms, || async move {
        client.klines(&symbol, &interval, limit).await
    })
    .await
}

#[derive(Deserialize)]
struct DepthQuery {
    limit: Option<u32>,
}

async fn market_depth(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Response {
    let symbol = match normalize_symbol(&symbol) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(20);
    if !DEPTH_LIMITS.contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("depth limit must be one of {DEPTH_LIMITS:?}"),
        );
    }

    let settings = state.config.read().request_cache.clone();
    let key = CacheKey::new(&settings.key_prefix, "depth", &symbol).with_param("limit", limit);
    let client = state.binance.clone();
    cached_pull(&state, key, settings.depth_ttl_ms, || async move {
        client.depth(&symbol, limit).await
    })
    .await
}

async fn market_mark(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    let symbol = match normalize_symbol(&symbol) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let settings = state.config.read().request_cache.clone();
    let key = CacheKey::new(&settings.key_prefix, "mark", &symbol);
    let client = state.binance.clone();
    cached_pull(&state, key, settings.mark_ttl_ms, || async move {
        client.mark_price(&symbol).await
    })
    .await
}

// =============================================================================
// Admin: global thresholds (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ThresholdsResponse {
    thresholds: ThresholdConfig,
    overridden_channels: usize,
}

async fn get_thresholds(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(ThresholdsResponse {
        thresholds: state.threshold_cache.thresholds(),
        overridden_channels: state.overrides.len(),
    })
}

async fn put_thresholds(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ThresholdConfig>,
) -> Response {
    let bounds = ThresholdOverride {
        percentage: body.percentage,
        absolute: body.absolute,
    };
    if let Err(reason) = bounds.validate() {
        return error_response(StatusCode::BAD_REQUEST, reason);
    }

    state.threshold_cache.set_thresholds(body);
    state.config.write().thresholds = body;
    info!(
        percentage = ?body.percentage,
        absolute = ?body.absolute,
        time_window_ms = body.time_window_ms,
        "global thresholds replaced"
    );

    let persisted = match state.persist_config() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to persist runtime config");
            state.errors.push_error(format!("config save failed: {e:#}"));
            false
        }
    };

    Json(serde_json::json!({
        "thresholds": body,
        "persisted": persisted,
    }))
    .into_response()
}

// =============================================================================
// Tests
// =============================================================================
