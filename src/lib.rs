// =============================================================================
// tickhub — market-data distribution layer
// =============================================================================
//
// Exchange push streams are normalized (`feed`), gated by a threshold cache
// (`cache`) and fanned out to WebSocket subscribers (`hub`). `client` is the
// reconnecting consumer side of the hub protocol.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod binance;
pub mod cache;
pub mod client;
pub mod error;
pub mod feed;
pub mod hub;
pub mod runtime_config;
pub mod types;
