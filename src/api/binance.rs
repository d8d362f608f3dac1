use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use super::{get_with_retry, http_client, MarketDataSource};
use crate::config::ProviderConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    BookLevel, Candle, CandleInterval, InstrumentMapping, OrderBook, Ticker,
};

const DEPTH_LEVELS: u32 = 100;

/// Binance-style exchange upstream: 24h ticker, klines, and the only
/// order-book depth in the provider set. Addressed by the mapping's
/// `exchange_pair` (e.g. "SOLUSDT"), never by the canonical id.
#[derive(Clone)]
pub struct BinanceSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    volume: String,
    price_change_percent: String,
}

#[derive(Debug, Deserialize)]
struct Depth {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn parse_f64(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| CoreError::Decode(format!("binance {field} not numeric: {raw:?}")))
}

fn parse_levels(field: &str, raw: Vec<[String; 2]>) -> Result<Vec<BookLevel>> {
    raw.into_iter()
        .map(|[price, quantity]| {
            Ok(BookLevel {
                price: parse_f64(field, &price)?,
                quantity: parse_f64(field, &quantity)?,
            })
        })
        .collect()
}

impl BinanceSource {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            client: http_client(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MarketDataSource for BinanceSource {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn ticker(&self, mapping: &InstrumentMapping) -> Result<Ticker> {
        let url = format!(
            "{}/api/v3/ticker/24hr?symbol={}",
            self.base_url, mapping.exchange_pair
        );

        let response = get_with_retry(&self.client, self.name(), &url).await?;
        let raw: Ticker24h = response
            .json()
            .await
            .map_err(|e| CoreError::Decode(format!("binance ticker payload: {e}")))?;

        Ok(Ticker {
            price: parse_f64("lastPrice", &raw.last_price)?,
            volume_24h: parse_f64("volume", &raw.volume)?,
            // The exchange knows nothing about market caps
            market_cap: None,
            price_change_24h_pct: parse_f64("priceChangePercent", &raw.price_change_percent).ok(),
            fetched_at: Utc::now(),
        })
    }

    async fn candles(
        &self,
        mapping: &InstrumentMapping,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            mapping.exchange_pair,
            interval.as_str(),
            limit
        );

        let response = get_with_retry(&self.client, self.name(), &url).await?;
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| CoreError::Decode(format!("binance klines payload: {e}")))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            // Kline rows are positional: openTime, open, high, low, close, volume, ...
            if row.len() < 6 {
                return Err(CoreError::Decode(format!(
                    "binance kline row has {} fields",
                    row.len()
                )));
            }
            let ts_ms = row[0].as_i64().ok_or_else(|| {
                CoreError::Decode(format!("binance kline open time: {:?}", row[0]))
            })?;
            let timestamp = chrono::DateTime::from_timestamp_millis(ts_ms)
                .ok_or_else(|| CoreError::Decode(format!("binance kline timestamp {ts_ms}")))?;

            let field = |i: usize, name: &str| -> Result<f64> {
                let raw = row[i].as_str().ok_or_else(|| {
                    CoreError::Decode(format!("binance kline {name}: {:?}", row[i]))
                })?;
                parse_f64(name, raw)
            };

            candles.push(Candle {
                timestamp,
                open: field(1, "open")?,
                high: field(2, "high")?,
                low: field(3, "low")?,
                close: field(4, "close")?,
                volume: field(5, "volume")?,
            });
        }

        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn order_book(&self, mapping: &InstrumentMapping) -> Result<OrderBook> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, mapping.exchange_pair, DEPTH_LEVELS
        );

        let response = get_with_retry(&self.client, self.name(), &url).await?;
        let raw: Depth = response
            .json()
            .await
            .map_err(|e| CoreError::Decode(format!("binance depth payload: {e}")))?;

        Ok(OrderBook {
            bids: parse_levels("bid", raw.bids)?,
            asks: parse_levels("ask", raw.asks)?,
            fetched_at: Utc::now(),
        })
    }
}
