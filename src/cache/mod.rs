pub mod keys;
pub mod request;
pub mod store;
pub mod threshold;

pub use keys::CacheKey;
pub use request::RequestCache;
pub use store::{CacheStore, MemoryStore};
pub use threshold::{
    CacheEntry, CachedValue, ChannelThreshold, OverrideTable, ThresholdCache, ThresholdConfig,
    ThresholdOverride, Verdict,
};
