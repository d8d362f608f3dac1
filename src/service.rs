use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::api::MarketDataSource;
use crate::discovery::{DiscoveryPipeline, DiscoveryReport};
use crate::error::{CoreError, Result};
use crate::ledger::{OpenSpec, PortfolioLedger};
use crate::limiter::ProviderRateLimiter;
use crate::market::MarketDataProvider;
use crate::models::{InstrumentMapping, PortfolioState, Position, Side};
use crate::persist::PgStore;
use crate::resolver::InstrumentResolver;

/// The call surface the external API/dashboard layer consumes. Owns no
/// hidden state: every collaborator is injected and shared by reference.
pub struct TradingService {
    resolver: Arc<InstrumentResolver>,
    provider: Arc<MarketDataProvider>,
    discovery: DiscoveryPipeline,
    ledger: Arc<Mutex<PortfolioLedger>>,
    store: Option<Arc<PgStore>>,
    universe_source: Arc<dyn MarketDataSource>,
    limiter: Arc<ProviderRateLimiter>,
    /// Numeric sentiment signals fed in by the narrative layer, by symbol.
    sentiment: RwLock<HashMap<String, f64>>,
}

impl TradingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<InstrumentResolver>,
        provider: Arc<MarketDataProvider>,
        discovery: DiscoveryPipeline,
        ledger: Arc<Mutex<PortfolioLedger>>,
        store: Option<Arc<PgStore>>,
        universe_source: Arc<dyn MarketDataSource>,
        limiter: Arc<ProviderRateLimiter>,
    ) -> Self {
        Self {
            resolver,
            provider,
            discovery,
            ledger,
            store,
            universe_source,
            limiter,
            sentiment: RwLock::new(HashMap::new()),
        }
    }

    /// Operator remediation for a known-bad mapping: clear the cached
    /// mapping and force a fresh resolution in one step.
    pub async fn resolve_and_invalidate(&self, symbol: &str) -> Result<InstrumentMapping> {
        self.resolver.invalidate(symbol).await;
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_mapping(&symbol.to_uppercase()).await {
                tracing::warn!(symbol, error = %e, "failed to delete persisted mapping");
            }
        }

        let mapping = self.resolver.resolve(symbol).await?;
        self.persist_mapping(&mapping).await;
        Ok(mapping)
    }

    /// One synchronous discovery cycle over the top of the ranked universe.
    pub async fn run_discovery(&self, universe_size: usize) -> Result<DiscoveryReport> {
        self.limiter.acquire(self.universe_source.name()).await?;
        let listed = self.universe_source.top_instruments(universe_size).await?;

        // The listing can carry symbol collisions; the universe is symbols,
        // ordered as listed, each scanned once.
        let mut universe = Vec::new();
        for meta in listed {
            if !universe.contains(&meta.symbol) {
                universe.push(meta.symbol);
            }
        }

        let sentiment = self.sentiment.read().unwrap().clone();
        Ok(self.discovery.discover(&universe, &sentiment).await)
    }

    pub async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_loss_price: f64,
        take_profit_price: f64,
    ) -> Result<Position> {
        let mapping = self.resolver.resolve(symbol).await?;
        self.persist_mapping(&mapping).await;

        let entry_price = self.provider.get_price(&mapping).await?;

        let position = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.open_position(OpenSpec {
                symbol: mapping.symbol.clone(),
                instrument_id: mapping.instrument_id.clone(),
                exchange_pair: mapping.exchange_pair.clone(),
                side,
                entry_price,
                quantity,
                stop_loss_price,
                take_profit_price,
            })?
        };

        self.persist_position(&position).await;
        Ok(position)
    }

    /// Manual close at the current market price.
    pub async fn close_position(&self, id: Uuid) -> Result<Position> {
        let open = {
            let ledger = self.ledger.lock().unwrap();
            ledger
                .position(id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("position {id}")))?
        };

        let mapping = InstrumentMapping {
            symbol: open.symbol.clone(),
            instrument_id: open.instrument_id.clone(),
            exchange_pair: open.exchange_pair.clone(),
            market_cap_rank: None,
            resolved_at: open.opened_at,
        };
        let price = self.provider.get_price(&mapping).await?;

        let closed = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.close_position(id, crate::models::CloseReason::Manual, price)?
        };

        if let Some(store) = &self.store {
            let state = { self.ledger.lock().unwrap().state() };
            if let Err(e) = store.save_trade(&closed, &state).await {
                tracing::warn!(position = %id, error = %e, "failed to persist manual close");
            }
        }

        Ok(closed)
    }

    pub fn portfolio_state(&self) -> PortfolioState {
        self.ledger.lock().unwrap().state()
    }

    /// Feed a numeric sentiment signal (0..1) for a symbol into discovery.
    pub fn set_sentiment(&self, symbol: &str, score: f64) {
        self.sentiment
            .write()
            .unwrap()
            .insert(symbol.to_uppercase(), score.clamp(0.0, 1.0));
    }

    async fn persist_mapping(&self, mapping: &InstrumentMapping) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_mapping(mapping).await {
                tracing::warn!(symbol = %mapping.symbol, error = %e, "failed to persist mapping");
            }
        }
    }

    async fn persist_position(&self, position: &Position) {
        if let Some(store) = &self.store {
            let state = { self.ledger.lock().unwrap().state() };
            if let Err(e) = store.save_trade(position, &state).await {
                tracing::warn!(position = %position.id, error = %e, "failed to persist position");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CoinGeckoSource;
    use crate::cache::MarketCache;
    use crate::config::{CacheTtlConfig, DiscoveryConfig, ProviderConfig, RiskConfig, RouteConfig};
    use crate::models::PositionStatus;

    fn service(base_url: &str) -> TradingService {
        let cfg = ProviderConfig {
            base_url: base_url.to_string(),
            api_key: None,
            max_requests: 100_000,
            interval_ms: 60_000,
        };
        let source: Arc<dyn MarketDataSource> = Arc::new(CoinGeckoSource::new(&cfg));
        let cache = Arc::new(MarketCache::new(CacheTtlConfig::default()));
        let limiter = Arc::new(ProviderRateLimiter::new(&[("coingecko", 100_000, 60_000)]));

        let resolver = Arc::new(InstrumentResolver::new(
            source.clone(),
            cache.clone(),
            limiter.clone(),
            3600,
        ));
        let provider = Arc::new(MarketDataProvider::new(
            vec![source.clone()],
            RouteConfig {
                price: vec!["coingecko".to_string()],
                candles: vec!["coingecko".to_string()],
                order_book: vec!["coingecko".to_string()],
            },
            cache,
            limiter.clone(),
        ));
        let ledger = Arc::new(Mutex::new(PortfolioLedger::new(
            10_000.0,
            RiskConfig::default(),
        )));
        let discovery = DiscoveryPipeline::new(
            resolver.clone(),
            provider.clone(),
            DiscoveryConfig::default(),
        );

        TradingService::new(resolver, provider, discovery, ledger, None, source, limiter)
    }

    const SOL_BODY: &str = r#"[{"id":"solana","symbol":"sol","name":"Solana",
        "current_price":100.0,"market_cap":68000000000.0,"market_cap_rank":5,
        "total_volume":2500000000.0,"price_change_percentage_24h":1.0}]"#;

    #[tokio::test]
    async fn test_open_then_manual_close() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(SOL_BODY)
            .create_async()
            .await;

        let s = service(&server.url());

        let position = s
            .open_position("SOL", Side::Long, 2.0, 90.0, 120.0)
            .await
            .unwrap();
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.instrument_id, "solana");
        assert_eq!(s.portfolio_state().cash_balance, 9_800.0);

        let closed = s.close_position(position.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(
            closed.close_reason,
            Some(crate::models::CloseReason::Manual)
        );
        assert_eq!(s.portfolio_state().cash_balance, 10_000.0);
    }

    #[tokio::test]
    async fn test_open_unknown_symbol_reports_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let s = service(&server.url());
        let err = s
            .open_position("GHOST", Side::Long, 1.0, 90.0, 120.0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_unknown_position_reports_not_found() {
        let s = service("http://127.0.0.1:9");
        let err = s.close_position(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
