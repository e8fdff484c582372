pub mod client;
pub mod rate_limit;

pub use client::{BinanceClient, DepthSnapshot, MarkPrice};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
