// =============================================================================
// Cache key namespace
// =============================================================================
//
//   <prefix>:<kind>:<SYMBOL>[:<param>=<value>...]
//
// Params are kept in a BTreeMap so the rendered key is deterministic no matter
// the order they were added in.
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;

use crate::types::ChannelKey;

/// Symbol slot used for symbol-less (firehose) channels.
const ALL_SYMBOLS: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: String,
    kind: String,
    symbol: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>, kind: impl AsRef<str>, symbol: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix.into(),
            kind: kind.as_ref().to_ascii_lowercase(),
            symbol: symbol.as_ref().to_ascii_uppercase(),
            params: BTreeMap::new(),
        }
    }

    /// Key holding the last accepted value of a channel.
    pub fn for_channel(prefix: impl Into<String>, channel: &ChannelKey) -> Self {
        let key = Self::new(
            prefix,
            channel.kind().as_str(),
            channel.symbol().unwrap_or(ALL_SYMBOLS),
        );
        match channel.interval() {
            Some(iv) => key.with_param("interval", iv),
            None => key,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.kind, self.symbol)?;
        for (name, value) in &self.params {
            write!(f, ":{name}={value}")?;
        }
        Ok(())
    }
}
