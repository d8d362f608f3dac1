use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::MarketDataSource;
use crate::cache::MarketCache;
use crate::error::{CoreError, Result};
use crate::limiter::ProviderRateLimiter;
use crate::models::{InstrumentMapping, InstrumentMeta};

/// Total order over colliding candidates: smallest market-cap rank wins,
/// candidates with no rank sort last, ties break on instrument id.
///
/// This is the function that makes a decoy token structurally unable to
/// shadow the prominent instrument behind the same ticker, no matter how
/// the upstream orders its response.
pub fn collision_order(a: &InstrumentMeta, b: &InstrumentMeta) -> Ordering {
    match (a.market_cap_rank, b.market_cap_rank) {
        (Some(ra), Some(rb)) => ra
            .cmp(&rb)
            .then_with(|| a.instrument_id.cmp(&b.instrument_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.instrument_id.cmp(&b.instrument_id),
    }
}

/// Maps a ticker symbol to exactly one authoritative upstream instrument.
///
/// A mapping, once resolved, is reused for every downstream price and
/// candle call until it is explicitly invalidated or its market-meta TTL
/// lapses — resolution never re-runs per fetch, so an open position keeps
/// addressing the same instrument even if upstream rankings shift.
pub struct InstrumentResolver {
    source: Arc<dyn MarketDataSource>,
    mappings: Arc<RwLock<HashMap<String, InstrumentMapping>>>,
    cache: Arc<MarketCache>,
    limiter: Arc<ProviderRateLimiter>,
    mapping_ttl: Duration,
}

impl InstrumentResolver {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        cache: Arc<MarketCache>,
        limiter: Arc<ProviderRateLimiter>,
        mapping_ttl_secs: u64,
    ) -> Self {
        Self {
            source,
            mappings: Arc::new(RwLock::new(HashMap::new())),
            cache,
            limiter,
            mapping_ttl: Duration::seconds(mapping_ttl_secs as i64),
        }
    }

    /// Restore previously persisted mappings (e.g. across a restart).
    pub async fn preload(&self, mappings: Vec<InstrumentMapping>) {
        let mut map = self.mappings.write().await;
        for m in mappings {
            map.insert(m.symbol.to_uppercase(), m);
        }
    }

    pub async fn resolve(&self, symbol: &str) -> Result<InstrumentMapping> {
        self.resolve_at(symbol, Utc::now()).await
    }

    /// Resolve with an explicit timestamp (deterministic in tests).
    pub async fn resolve_at(&self, symbol: &str, now: DateTime<Utc>) -> Result<InstrumentMapping> {
        let key = symbol.to_uppercase();

        {
            let mappings = self.mappings.read().await;
            if let Some(mapping) = mappings.get(&key) {
                if now < mapping.resolved_at + self.mapping_ttl {
                    return Ok(mapping.clone());
                }
            }
        }

        self.limiter.acquire(self.source.name()).await?;
        let candidates = self.source.search_instruments(&key).await?;

        if candidates.is_empty() {
            return Err(CoreError::NotFound(format!(
                "no instrument matches symbol {key}"
            )));
        }

        let chosen = select_candidate(&key, &candidates);

        let mapping = InstrumentMapping {
            symbol: key.clone(),
            instrument_id: chosen.instrument_id.clone(),
            exchange_pair: format!("{key}USDT"),
            market_cap_rank: chosen.market_cap_rank,
            resolved_at: now,
        };

        self.mappings.write().await.insert(key, mapping.clone());
        Ok(mapping)
    }

    /// Drop the active mapping and any cached data for the symbol, forcing
    /// the next resolution to hit the upstream. Operator remediation path
    /// for a known-bad mapping.
    pub async fn invalidate(&self, symbol: &str) -> Option<InstrumentMapping> {
        let key = symbol.to_uppercase();
        let removed = self.mappings.write().await.remove(&key);

        if let Some(mapping) = &removed {
            self.cache.invalidate(&mapping.instrument_id);
            tracing::info!(
                symbol = %key,
                instrument_id = %mapping.instrument_id,
                "mapping invalidated"
            );
        }

        removed
    }

    /// Copies of the currently active mappings (for persistence).
    pub async fn active_mappings(&self) -> Vec<InstrumentMapping> {
        self.mappings.read().await.values().cloned().collect()
    }
}

/// Apply the collision policy and make every multi-candidate resolution
/// auditable: the full candidate set and the winner are logged.
fn select_candidate<'a>(symbol: &str, candidates: &'a [InstrumentMeta]) -> &'a InstrumentMeta {
    let chosen = candidates
        .iter()
        .min_by(|a, b| collision_order(a, b))
        .expect("candidates checked non-empty");

    if candidates.len() > 1 {
        let listing: Vec<String> = candidates
            .iter()
            .map(|c| {
                format!(
                    "{} (rank {})",
                    c.instrument_id,
                    c.market_cap_rank
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                )
            })
            .collect();
        tracing::warn!(
            symbol,
            candidates = %listing.join(", "),
            chosen = %chosen.instrument_id,
            "ambiguous symbol resolved by market-cap rank"
        );
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheCategory;
    use crate::config::{CacheTtlConfig, ProviderConfig};
    use crate::api::CoinGeckoSource;

    fn meta(id: &str, rank: Option<u32>) -> InstrumentMeta {
        InstrumentMeta {
            instrument_id: id.to_string(),
            symbol: "X".to_string(),
            name: id.to_string(),
            market_cap_rank: rank,
            market_cap: Some(1_000_000.0),
            volume_24h: Some(10_000.0),
            price_change_24h_pct: Some(0.0),
            price: Some(1.0),
        }
    }

    #[test]
    fn test_smallest_rank_wins() {
        let official = meta("official-x", Some(70));
        let decoy = meta("decoy-x", Some(4000));
        assert_eq!(collision_order(&official, &decoy), Ordering::Less);

        let candidates = vec![decoy, official];
        assert_eq!(select_candidate("X", &candidates).instrument_id, "official-x");
    }

    #[test]
    fn test_unknown_rank_sorts_last_not_first() {
        let ranked = meta("ranked-x", Some(4000));
        let unranked = meta("aaa-unranked-x", None);
        assert_eq!(collision_order(&ranked, &unranked), Ordering::Less);

        // Even a terrible rank beats no rank, regardless of id order
        let candidates = vec![unranked, ranked];
        assert_eq!(select_candidate("X", &candidates).instrument_id, "ranked-x");
    }

    #[test]
    fn test_ties_break_lexicographically() {
        let a = meta("alpha-x", Some(10));
        let b = meta("beta-x", Some(10));
        let candidates = vec![b, a];
        assert_eq!(select_candidate("X", &candidates).instrument_id, "alpha-x");

        let both_unranked = vec![meta("zeta-x", None), meta("eta-x", None)];
        assert_eq!(
            select_candidate("X", &both_unranked).instrument_id,
            "eta-x"
        );
    }

    #[test]
    fn test_selection_is_independent_of_response_order() {
        let mut candidates = vec![
            meta("decoy-x", Some(4000)),
            meta("official-x", Some(70)),
            meta("unranked-x", None),
        ];
        let first = select_candidate("X", &candidates).instrument_id.clone();
        candidates.reverse();
        let second = select_candidate("X", &candidates).instrument_id.clone();
        assert_eq!(first, second);
        assert_eq!(first, "official-x");
    }

    fn resolver(base_url: &str) -> InstrumentResolver {
        let cfg = ProviderConfig {
            base_url: base_url.to_string(),
            api_key: None,
            max_requests: 1000,
            interval_ms: 60_000,
        };
        InstrumentResolver::new(
            Arc::new(CoinGeckoSource::new(&cfg)),
            Arc::new(MarketCache::new(CacheTtlConfig::default())),
            Arc::new(ProviderRateLimiter::new(&[("coingecko", 1000, 60_000)])),
            3600,
        )
    }

    const COLLISION_BODY: &str = r#"[
        {"id":"decoy-x","symbol":"x","name":"Decoy","current_price":0.01,
         "market_cap":50000.0,"market_cap_rank":4000,"total_volume":100.0,
         "price_change_percentage_24h":0.0},
        {"id":"official-x","symbol":"x","name":"Official","current_price":10.0,
         "market_cap":900000000.0,"market_cap_rank":70,"total_volume":5000000.0,
         "price_change_percentage_24h":1.0}]"#;

    #[tokio::test]
    async fn test_resolve_caches_until_invalidated() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(COLLISION_BODY)
            .expect(2)
            .create_async()
            .await;

        let r = resolver(&server.url());

        // Repeated resolution: one upstream hit, same winner every time
        for _ in 0..5 {
            let mapping = r.resolve("X").await.unwrap();
            assert_eq!(mapping.instrument_id, "official-x");
            assert_eq!(mapping.market_cap_rank, Some(70));
            assert_eq!(mapping.exchange_pair, "XUSDT");
        }

        // Invalidation forces exactly one fresh resolution
        assert!(r.invalidate("x").await.is_some());
        let mapping = r.resolve("X").await.unwrap();
        assert_eq!(mapping.instrument_id, "official-x");

        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_mapping_re_resolves() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(COLLISION_BODY)
            .expect(2)
            .create_async()
            .await;

        let r = resolver(&server.url());
        let t0 = Utc::now();

        r.resolve_at("X", t0).await.unwrap();
        // Within TTL: cached
        r.resolve_at("X", t0 + Duration::seconds(3599)).await.unwrap();
        // Past TTL: fresh upstream resolution
        r.resolve_at("X", t0 + Duration::seconds(3601)).await.unwrap();

        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let err = resolver(&server.url()).resolve("GHOST").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invalidate_clears_cached_instrument_data() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(COLLISION_BODY)
            .create_async()
            .await;

        let cache = Arc::new(MarketCache::new(CacheTtlConfig::default()));
        let cfg = ProviderConfig {
            base_url: server.url(),
            api_key: None,
            max_requests: 1000,
            interval_ms: 60_000,
        };
        let r = InstrumentResolver::new(
            Arc::new(CoinGeckoSource::new(&cfg)),
            cache.clone(),
            Arc::new(ProviderRateLimiter::new(&[("coingecko", 1000, 60_000)])),
            3600,
        );

        let mapping = r.resolve("X").await.unwrap();
        cache.put_json(CacheCategory::Price, &mapping.instrument_id, &10.0);

        r.invalidate("X").await;
        let cached: Option<f64> = cache.get_json(CacheCategory::Price, &mapping.instrument_id);
        assert!(cached.is_none());
    }
}
