use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{CacheCategory, MarketCache};
use crate::config::RouteConfig;
use crate::error::{CoreError, Result};
use crate::limiter::ProviderRateLimiter;
use crate::models::{Candle, CandleInterval, InstrumentMapping, OrderBook, Ticker};
use crate::api::MarketDataSource;

/// Capabilities a provider route can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Price,
    Candles,
    OrderBook,
}

/// Typed outcome of one provider attempt. Fallback is a pure decision
/// over this value rather than nested error handling: `Retryable` moves
/// to the next provider in the route, `Fatal` surfaces immediately.
pub enum FetchOutcome<T> {
    Ok(T),
    Retryable(CoreError),
    Fatal(CoreError),
}

pub fn classify<T>(result: Result<T>) -> FetchOutcome<T> {
    match result {
        Ok(value) => FetchOutcome::Ok(value),
        Err(e) if e.is_retryable() => FetchOutcome::Retryable(e),
        Err(e) => FetchOutcome::Fatal(e),
    }
}

/// Cache-first, rate-limited market data access over an ordered list of
/// competing upstreams, routed per capability.
pub struct MarketDataProvider {
    sources: HashMap<String, Arc<dyn MarketDataSource>>,
    routes: RouteConfig,
    cache: Arc<MarketCache>,
    limiter: Arc<ProviderRateLimiter>,
}

impl MarketDataProvider {
    pub fn new(
        sources: Vec<Arc<dyn MarketDataSource>>,
        routes: RouteConfig,
        cache: Arc<MarketCache>,
        limiter: Arc<ProviderRateLimiter>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        Self {
            sources,
            routes,
            cache,
            limiter,
        }
    }

    fn route(&self, capability: Capability) -> Vec<Arc<dyn MarketDataSource>> {
        let names = match capability {
            Capability::Price => &self.routes.price,
            Capability::Candles => &self.routes.candles,
            Capability::OrderBook => &self.routes.order_book,
        };

        names
            .iter()
            .filter_map(|name| {
                let source = self.sources.get(name).cloned();
                if source.is_none() {
                    tracing::warn!(provider = %name, "route names an unconfigured provider");
                }
                source
            })
            .collect()
    }

    /// Walk the route for one capability: bounded-wait rate gate, one
    /// attempt per provider, fall back only on retryable failures.
    async fn try_route<T, F>(&self, capability: Capability, mut attempt: F) -> Result<T>
    where
        F: FnMut(
            Arc<dyn MarketDataSource>,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send>>,
    {
        let route = self.route(capability);
        let mut last_error = None;

        for source in route {
            if let Err(e) = self.limiter.acquire(source.name()).await {
                tracing::warn!(
                    provider = source.name(),
                    error = %e,
                    "rate budget exhausted beyond bounded wait, trying next provider"
                );
                last_error = Some(e);
                continue;
            }

            match classify(attempt(source.clone()).await) {
                FetchOutcome::Ok(value) => return Ok(value),
                FetchOutcome::Fatal(e) => return Err(e),
                FetchOutcome::Retryable(e) => {
                    tracing::warn!(
                        provider = source.name(),
                        error = %e,
                        "provider failed, falling back"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CoreError::UpstreamUnavailable(format!("no provider configured for {capability:?}"))
        }))
    }

    /// Current price, addressed by the resolved mapping.
    pub async fn get_price(&self, mapping: &InstrumentMapping) -> Result<f64> {
        Ok(self.get_ticker(mapping).await?.price)
    }

    /// Full market snapshot (price, volume, market cap where the venue
    /// knows it).
    pub async fn get_ticker(&self, mapping: &InstrumentMapping) -> Result<Ticker> {
        let key = mapping.instrument_id.clone();
        if let Some(ticker) = self.cache.get_json::<Ticker>(CacheCategory::Price, &key) {
            return Ok(ticker);
        }

        let m = mapping.clone();
        let ticker = self
            .try_route(Capability::Price, move |source| {
                let m = m.clone();
                Box::pin(async move { source.ticker(&m).await })
            })
            .await?;

        self.cache.put_json(CacheCategory::Price, &key, &ticker);
        Ok(ticker)
    }

    /// Ordered OHLC candles, oldest first.
    pub async fn get_candles(
        &self,
        mapping: &InstrumentMapping,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let key = format!("{}:{}:{}", mapping.instrument_id, interval.as_str(), limit);
        if let Some(candles) = self
            .cache
            .get_json::<Vec<Candle>>(CacheCategory::Candles, &key)
        {
            return Ok(candles);
        }

        let m = mapping.clone();
        let candles = self
            .try_route(Capability::Candles, move |source| {
                let m = m.clone();
                Box::pin(async move { source.candles(&m, interval, limit).await })
            })
            .await?;

        self.cache.put_json(CacheCategory::Candles, &key, &candles);
        Ok(candles)
    }

    /// Bid/ask depth ladder, best levels first.
    pub async fn get_order_book(&self, mapping: &InstrumentMapping) -> Result<OrderBook> {
        // Depth shares the price TTL: it goes stale just as fast.
        let key = format!("book:{}", mapping.instrument_id);
        if let Some(book) = self.cache.get_json::<OrderBook>(CacheCategory::Price, &key) {
            return Ok(book);
        }

        let m = mapping.clone();
        let book = self
            .try_route(Capability::OrderBook, move |source| {
                let m = m.clone();
                Box::pin(async move { source.order_book(&m).await })
            })
            .await?;

        self.cache.put_json(CacheCategory::Price, &key, &book);
        Ok(book)
    }

    /// Estimated execution-price deviation (as a fraction of best ask) for
    /// buying `quantity`, from the current depth ladder.
    pub async fn estimate_slippage(
        &self,
        mapping: &InstrumentMapping,
        quantity: f64,
    ) -> Result<f64> {
        let book = self.get_order_book(mapping).await?;
        estimate_slippage_from_book(&book, quantity, &mapping.symbol)
    }
}

/// VWAP-vs-best-ask deviation walking the ask ladder. When the book is
/// thinner than the requested quantity the whole-book estimate is
/// returned with a warning rather than failing the caller.
pub fn estimate_slippage_from_book(book: &OrderBook, quantity: f64, symbol: &str) -> Result<f64> {
    let best_ask = book
        .asks
        .first()
        .map(|l| l.price)
        .ok_or_else(|| CoreError::UpstreamUnavailable(format!("empty ask ladder for {symbol}")))?;

    let mut remaining = quantity;
    let mut cost = 0.0;
    let mut filled = 0.0;

    for level in &book.asks {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(level.quantity);
        cost += take * level.price;
        filled += take;
        remaining -= take;
    }

    if remaining > 0.0 {
        tracing::warn!(
            symbol,
            requested = quantity,
            available = filled,
            "order book depth short of requested quantity, estimate covers the whole book"
        );
    }

    if filled <= 0.0 {
        return Err(CoreError::UpstreamUnavailable(format!(
            "no ask liquidity for {symbol}"
        )));
    }

    let vwap = cost / filled;
    Ok((vwap - best_ask) / best_ask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BinanceSource, CoinGeckoSource};
    use crate::config::{CacheTtlConfig, ProviderConfig};
    use crate::models::BookLevel;
    use chrono::Utc;

    fn mapping() -> InstrumentMapping {
        InstrumentMapping {
            symbol: "SOL".to_string(),
            instrument_id: "solana".to_string(),
            exchange_pair: "SOLUSDT".to_string(),
            market_cap_rank: Some(5),
            resolved_at: Utc::now(),
        }
    }

    fn provider_cfg(base_url: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: base_url.to_string(),
            api_key: None,
            max_requests: 1000,
            interval_ms: 60_000,
        }
    }

    fn provider(gecko_url: &str, binance_url: &str, routes: RouteConfig) -> MarketDataProvider {
        let limiter = Arc::new(ProviderRateLimiter::new(&[
            ("coingecko", 1000, 60_000),
            ("binance", 1000, 60_000),
        ]));
        let cache = Arc::new(MarketCache::new(CacheTtlConfig::default()));
        MarketDataProvider::new(
            vec![
                Arc::new(CoinGeckoSource::new(&provider_cfg(gecko_url))),
                Arc::new(BinanceSource::new(&provider_cfg(binance_url))),
            ],
            routes,
            cache,
            limiter,
        )
    }

    #[test]
    fn test_classify_splits_on_retryability() {
        assert!(matches!(
            classify::<()>(Err(CoreError::UpstreamUnavailable("503".into()))),
            FetchOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify::<()>(Err(CoreError::NotFound("ghost".into()))),
            FetchOutcome::Fatal(_)
        ));
        assert!(matches!(classify(Ok(1)), FetchOutcome::Ok(1)));
    }

    #[test]
    fn test_slippage_walks_the_ladder() {
        let book = OrderBook {
            bids: vec![],
            asks: vec![
                BookLevel {
                    price: 100.0,
                    quantity: 5.0,
                },
                BookLevel {
                    price: 101.0,
                    quantity: 10.0,
                },
            ],
            fetched_at: Utc::now(),
        };

        // 10 units: 5 @ 100 + 5 @ 101 -> vwap 100.5 -> 0.5% over best ask
        let slip = estimate_slippage_from_book(&book, 10.0, "SOL").unwrap();
        assert!((slip - 0.005).abs() < 1e-12);

        // Entirely inside the best level: zero slippage
        let slip = estimate_slippage_from_book(&book, 3.0, "SOL").unwrap();
        assert_eq!(slip, 0.0);
    }

    #[test]
    fn test_slippage_short_depth_uses_whole_book() {
        let book = OrderBook {
            bids: vec![],
            asks: vec![BookLevel {
                price: 100.0,
                quantity: 1.0,
            }],
            fetched_at: Utc::now(),
        };

        let slip = estimate_slippage_from_book(&book, 50.0, "SOL").unwrap();
        assert_eq!(slip, 0.0);

        let empty = OrderBook {
            bids: vec![],
            asks: vec![],
            fetched_at: Utc::now(),
        };
        assert!(estimate_slippage_from_book(&empty, 1.0, "SOL").is_err());
    }

    #[tokio::test]
    async fn test_price_falls_back_on_server_error() {
        let mut gecko = mockito::Server::new_async().await;
        let mut binance = mockito::Server::new_async().await;

        let gecko_mock = gecko
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .expect(3)
            .create_async()
            .await;
        let binance_mock = binance
            .mock("GET", "/api/v3/ticker/24hr")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lastPrice":"141.00","volume":"1000","priceChangePercent":"0.5"}"#)
            .create_async()
            .await;

        let p = provider(&gecko.url(), &binance.url(), RouteConfig::default());
        let price = p.get_price(&mapping()).await.unwrap();

        assert_eq!(price, 141.0);
        gecko_mock.assert_async().await;
        binance_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_confirmed_not_found_skips_fallback() {
        let mut gecko = mockito::Server::new_async().await;
        let mut binance = mockito::Server::new_async().await;

        let _gecko_mock = gecko
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let binance_mock = binance
            .mock("GET", "/api/v3/ticker/24hr")
            .match_query(mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let p = provider(&gecko.url(), &binance.url(), RouteConfig::default());
        let err = p.get_price(&mapping()).await.unwrap_err();

        assert!(matches!(err, CoreError::NotFound(_)));
        binance_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let mut gecko = mockito::Server::new_async().await;
        let gecko_mock = gecko
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"id":"solana","symbol":"sol","name":"Solana","current_price":140.0,
                     "market_cap":1.0,"market_cap_rank":5,"total_volume":2.0,
                     "price_change_percentage_24h":0.0}]"#,
            )
            .expect(1)
            .create_async()
            .await;

        let p = provider(&gecko.url(), "http://127.0.0.1:9", RouteConfig::default());
        assert_eq!(p.get_price(&mapping()).await.unwrap(), 140.0);
        assert_eq!(p.get_price(&mapping()).await.unwrap(), 140.0);

        gecko_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_book_routes_to_exchange_only() {
        let mut binance = mockito::Server::new_async().await;
        let _m = binance
            .mock("GET", "/api/v3/depth")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"bids":[["99.0","1.0"]],"asks":[["100.0","2.0"]]}"#)
            .create_async()
            .await;

        // Gecko side is unreachable; the order-book route never touches it.
        let p = provider("http://127.0.0.1:9", &binance.url(), RouteConfig::default());
        let slip = p.estimate_slippage(&mapping(), 1.0).await.unwrap();
        assert_eq!(slip, 0.0);
    }
}
