use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::CacheTtlConfig;

/// Cache categories with independent TTL policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Price,
    Candles,
    MarketMeta,
    News,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Process-wide best-effort cache in front of every upstream call.
///
/// Entries are replaced whole on the next successful fetch, never patched.
/// A read at or after `expires_at` is a miss regardless of presence, and a
/// miss is never an error: callers always fall through to a live fetch.
pub struct MarketCache {
    entries: RwLock<HashMap<(CacheCategory, String), CacheEntry>>,
    ttls: CacheTtlConfig,
}

impl MarketCache {
    pub fn new(ttls: CacheTtlConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttls,
        }
    }

    fn ttl_for(&self, category: CacheCategory) -> Duration {
        let secs = match category {
            CacheCategory::Price => self.ttls.price_secs,
            CacheCategory::Candles => self.ttls.candles_secs,
            CacheCategory::MarketMeta => self.ttls.market_meta_secs,
            CacheCategory::News => self.ttls.news_secs,
        };
        Duration::seconds(secs as i64)
    }

    pub fn get(&self, category: CacheCategory, key: &str) -> Option<serde_json::Value> {
        self.get_at(category, key, Utc::now())
    }

    /// Read with an explicit timestamp (deterministic in tests).
    pub fn get_at(
        &self,
        category: CacheCategory,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<serde_json::Value> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&(category, key.to_string()))?;

        if now >= entry.expires_at {
            return None;
        }

        Some(entry.value.clone())
    }

    pub fn set(&self, category: CacheCategory, key: &str, value: serde_json::Value) {
        self.set_at(category, key, value, Utc::now());
    }

    pub fn set_at(
        &self,
        category: CacheCategory,
        key: &str,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let entry = CacheEntry {
            value,
            expires_at: now + self.ttl_for(category),
        };
        self.entries
            .write()
            .unwrap()
            .insert((category, key.to_string()), entry);
    }

    /// Typed read helper. A present-but-undecodable entry counts as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, category: CacheCategory, key: &str) -> Option<T> {
        let value = self.get(category, key)?;
        serde_json::from_value(value).ok()
    }

    pub fn put_json<T: Serialize>(&self, category: CacheCategory, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(category, key, v),
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize cache value"),
        }
    }

    /// Drop a key from every category. Exposed to operators so a known-bad
    /// mapping can be cleared without a restart.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|(_, k), _| k.as_str() != key);
    }

    /// Housekeeping sweep; safe to call from any loop.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
