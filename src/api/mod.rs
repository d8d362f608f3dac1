pub mod binance;
pub mod coingecko;

pub use binance::BinanceSource;
pub use coingecko::CoinGeckoSource;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::{sleep, Duration};

use crate::error::{CoreError, Result};
use crate::models::{Candle, CandleInterval, InstrumentMapping, InstrumentMeta, OrderBook, Ticker};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 250;

/// One upstream market-data provider.
///
/// Implementations must keep "instrument unknown" (`NotFound`) distinct
/// from transport/availability failures (`UpstreamUnavailable`): the
/// multi-source provider falls back on the latter but never on the former.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ticker(&self, mapping: &InstrumentMapping) -> Result<Ticker>;

    async fn candles(
        &self,
        mapping: &InstrumentMapping,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn order_book(&self, mapping: &InstrumentMapping) -> Result<OrderBook>;

    /// All instruments sharing the given ticker symbol, for resolution.
    async fn search_instruments(&self, _symbol: &str) -> Result<Vec<InstrumentMeta>> {
        Err(CoreError::UpstreamUnavailable(format!(
            "{} does not list instruments by symbol",
            self.name()
        )))
    }

    /// Top of the market-cap-ordered universe, for discovery.
    async fn top_instruments(&self, _limit: usize) -> Result<Vec<InstrumentMeta>> {
        Err(CoreError::UpstreamUnavailable(format!(
            "{} does not serve a ranked universe",
            self.name()
        )))
    }
}

/// Rate-limited upstreams share one GET-with-retry ladder: 429 and 5xx
/// back off exponentially, other 4xx mean the venue does not know the
/// instrument, network errors retry then surface as unavailable.
pub(crate) async fn get_with_retry(client: &Client, name: &str, url: &str) -> Result<reqwest::Response> {
    let mut last_error = None;

    for attempt in 1..=MAX_RETRIES {
        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1));
                    tracing::warn!(
                        provider = name,
                        %status,
                        attempt,
                        max = MAX_RETRIES,
                        "upstream error, backing off {:?}",
                        backoff
                    );
                    last_error = Some(CoreError::UpstreamUnavailable(format!(
                        "{name} returned {status}"
                    )));
                    if attempt < MAX_RETRIES {
                        sleep(backoff).await;
                    }
                    continue;
                }

                // Remaining 4xx: the venue does not know this instrument
                // (Binance signals it with 400, CoinGecko with 404).
                return Err(CoreError::NotFound(format!(
                    "{name} has no data at {url} ({status})"
                )));
            }
            Err(e) => {
                tracing::warn!(
                    provider = name,
                    error = %e,
                    attempt,
                    max = MAX_RETRIES,
                    "network error"
                );
                last_error = Some(CoreError::UpstreamUnavailable(format!(
                    "{name} unreachable: {e}"
                )));
                if attempt < MAX_RETRIES {
                    sleep(Duration::from_millis(
                        INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1),
                    ))
                    .await;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| CoreError::UpstreamUnavailable(format!("{name}: retries exhausted"))))
}

pub(crate) fn http_client() -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}
