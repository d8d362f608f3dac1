use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use super::{get_with_retry, http_client, MarketDataSource};
use crate::config::ProviderConfig;
use crate::error::{CoreError, Result};
use crate::models::{Candle, CandleInterval, InstrumentMapping, InstrumentMeta, OrderBook, Ticker};

/// CoinGecko-style upstream: authoritative id universe with market-cap
/// ranks, spot price, and OHLC. No order-book depth on this venue.
#[derive(Clone)]
pub struct CoinGeckoSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

/// Row from /coins/markets
#[derive(Debug, Deserialize)]
struct MarketRow {
    id: String,
    symbol: String,
    name: String,
    current_price: Option<f64>,
    market_cap: Option<f64>,
    market_cap_rank: Option<u32>,
    total_volume: Option<f64>,
    price_change_percentage_24h: Option<f64>,
}

impl From<MarketRow> for InstrumentMeta {
    fn from(row: MarketRow) -> Self {
        InstrumentMeta {
            instrument_id: row.id,
            symbol: row.symbol.to_uppercase(),
            name: row.name,
            market_cap_rank: row.market_cap_rank,
            market_cap: row.market_cap,
            volume_24h: row.total_volume,
            price_change_24h_pct: row.price_change_percentage_24h,
            price: row.current_price,
        }
    }
}

impl CoinGeckoSource {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            client: http_client(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        let mut url = format!("{}{}", self.base_url, path_and_query);
        if let Some(key) = &self.api_key {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push_str(&format!("{sep}x_cg_demo_api_key={key}"));
        }
        url
    }

    async fn markets(&self, query: &str) -> Result<Vec<MarketRow>> {
        let url = self.url(&format!("/coins/markets?vs_currency=usd&{query}"));
        let response = get_with_retry(&self.client, self.name(), &url).await?;

        response
            .json::<Vec<MarketRow>>()
            .await
            .map_err(|e| CoreError::Decode(format!("coingecko markets payload: {e}")))
    }
}

#[async_trait]
impl MarketDataSource for CoinGeckoSource {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn ticker(&self, mapping: &InstrumentMapping) -> Result<Ticker> {
        let rows = self.markets(&format!("ids={}", mapping.instrument_id)).await?;

        // A well-formed empty answer is a confirmed "no such instrument",
        // not a transport failure.
        let row = rows.into_iter().next().ok_or_else(|| {
            CoreError::NotFound(format!("coingecko has no market for {}", mapping.instrument_id))
        })?;

        Ok(Ticker {
            price: row.current_price.ok_or_else(|| {
                CoreError::Decode(format!("coingecko price missing for {}", mapping.instrument_id))
            })?,
            volume_24h: row.total_volume.unwrap_or(0.0),
            market_cap: row.market_cap,
            price_change_24h_pct: row.price_change_percentage_24h,
            fetched_at: Utc::now(),
        })
    }

    async fn candles(
        &self,
        mapping: &InstrumentMapping,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        // The OHLC endpoint is day-ranged; granularity follows the range.
        let days = match interval {
            CandleInterval::OneDay => 30,
            CandleInterval::OneHour => 7,
            _ => 1,
        };
        let url = self.url(&format!(
            "/coins/{}/ohlc?vs_currency=usd&days={days}",
            mapping.instrument_id
        ));

        let response = get_with_retry(&self.client, self.name(), &url).await?;
        let rows: Vec<[f64; 5]> = response
            .json()
            .await
            .map_err(|e| CoreError::Decode(format!("coingecko ohlc payload: {e}")))?;

        let mut candles = Vec::with_capacity(rows.len().min(limit));
        for [ts_ms, open, high, low, close] in rows {
            let timestamp = chrono::DateTime::from_timestamp_millis(ts_ms as i64)
                .ok_or_else(|| CoreError::Decode(format!("coingecko ohlc timestamp {ts_ms}")))?;
            candles.push(Candle {
                timestamp,
                open,
                high,
                low,
                close,
                // This venue's OHLC carries no per-candle volume
                volume: 0.0,
            });
        }

        candles.sort_by_key(|c| c.timestamp);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn order_book(&self, _mapping: &InstrumentMapping) -> Result<OrderBook> {
        Err(CoreError::UpstreamUnavailable(
            "coingecko serves no order-book depth".to_string(),
        ))
    }

    async fn search_instruments(&self, symbol: &str) -> Result<Vec<InstrumentMeta>> {
        let rows = self
            .markets(&format!("symbols={}", symbol.to_lowercase()))
            .await?;

        let wanted = symbol.to_uppercase();
        Ok(rows
            .into_iter()
            .map(InstrumentMeta::from)
            .filter(|m| m.symbol == wanted)
            .collect())
    }

    async fn top_instruments(&self, limit: usize) -> Result<Vec<InstrumentMeta>> {
        let rows = self
            .markets(&format!("order=market_cap_desc&per_page={limit}&page=1"))
            .await?;
        Ok(rows.into_iter().map(InstrumentMeta::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(base_url: &str) -> CoinGeckoSource {
        CoinGeckoSource::new(&ProviderConfig {
            base_url: base_url.to_string(),
            api_key: None,
            max_requests: 100,
            interval_ms: 60_000,
        })
    }

    fn mapping(id: &str) -> InstrumentMapping {
        InstrumentMapping {
            symbol: "SOL".to_string(),
            instrument_id: id.to_string(),
            exchange_pair: "SOLUSDT".to_string(),
            market_cap_rank: Some(5),
            resolved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ticker_parses_market_row() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("vs_currency".into(), "usd".into()),
                mockito::Matcher::UrlEncoded("ids".into(), "solana".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"[{"id":"solana","symbol":"sol","name":"Solana","current_price":142.5,
                     "market_cap":68000000000.0,"market_cap_rank":5,"total_volume":2500000000.0,
                     "price_change_percentage_24h":3.2}]"#,
            )
            .create_async()
            .await;

        let ticker = source(&server.url()).ticker(&mapping("solana")).await.unwrap();
        assert_eq!(ticker.price, 142.5);
        assert_eq!(ticker.market_cap, Some(68_000_000_000.0));
        assert_eq!(ticker.price_change_24h_pct, Some(3.2));
    }

    #[tokio::test]
    async fn test_empty_market_row_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let err = source(&server.url()).ticker(&mapping("ghost")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_search_filters_to_exact_symbol() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"id":"official-x","symbol":"x","name":"X","current_price":1.0,
                     "market_cap":1000000.0,"market_cap_rank":70,"total_volume":5000.0,
                     "price_change_percentage_24h":0.1},
                    {"id":"unrelated","symbol":"xy","name":"XY","current_price":2.0,
                     "market_cap":null,"market_cap_rank":null,"total_volume":null,
                     "price_change_percentage_24h":null}]"#,
            )
            .create_async()
            .await;

        let metas = source(&server.url()).search_instruments("X").await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].instrument_id, "official-x");
    }

    #[tokio::test]
    async fn test_candles_sorted_and_limited() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/coins/solana/ohlc")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[[1700000300000,103,104,102,103.5],
                    [1700000000000,100,101,99,100.5],
                    [1700000600000,104,105,103,104.5]]"#,
            )
            .create_async()
            .await;

        let candles = source(&server.url())
            .candles(&mapping("solana"), CandleInterval::FiveMinutes, 2)
            .await
            .unwrap();

        assert_eq!(candles.len(), 2);
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[1].close, 104.5);
    }

    #[tokio::test]
    async fn test_server_error_retries_then_surfaces() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/coins/markets")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = source(&server.url()).ticker(&mapping("solana")).await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_book_unsupported() {
        let err = source("http://127.0.0.1:9")
            .order_book(&mapping("solana"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
    }
}
