pub mod score;

pub use score::{composite_score, ScoreInputs};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::market::MarketDataProvider;
use crate::models::InstrumentMapping;
use crate::resolver::InstrumentResolver;

/// One instrument admitted by the discovery filters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredCandidate {
    pub symbol: String,
    pub instrument_id: String,
    pub score: f64,
    pub market_cap: f64,
    pub volume_24h: f64,
    pub price: f64,
}

/// Exhaustive accounting of everything the scan rejected. The invariant
/// `total() + candidates == scanned` must reconcile for every run; a
/// mismatch is a data-integrity bug, surfaced loudly but non-fatally.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RejectionLedger {
    pub reason_counts: BTreeMap<String, u32>,
    pub total: u32,
}

impl RejectionLedger {
    pub fn record(&mut self, reason: impl Into<String>) {
        *self.reason_counts.entry(reason.into()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn sum(&self) -> u32 {
        self.reason_counts.values().sum()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveryReport {
    pub candidates: Vec<ScoredCandidate>,
    pub rejections: RejectionLedger,
    pub scanned: usize,
}

// Stable reason strings so counts aggregate across candidates.
const REASON_MCAP_FLOOR: &str = "MarketCapBelowFloor";
const REASON_MCAP_CEILING: &str = "MarketCapAboveCeiling";
const REASON_VOLUME_FLOOR: &str = "VolumeBelowFloor";
const REASON_SCORE: &str = "CompositeScoreBelowThreshold";

enum Verdict {
    Accepted(ScoredCandidate),
    Rejected(&'static str),
}

/// Filters and ranks a universe of ticker symbols into scored candidates
/// plus a fully countable rejection ledger.
pub struct DiscoveryPipeline {
    resolver: Arc<InstrumentResolver>,
    provider: Arc<MarketDataProvider>,
    filters: DiscoveryConfig,
}

impl DiscoveryPipeline {
    pub fn new(
        resolver: Arc<InstrumentResolver>,
        provider: Arc<MarketDataProvider>,
        filters: DiscoveryConfig,
    ) -> Self {
        Self {
            resolver,
            provider,
            filters,
        }
    }

    /// Scan the universe in order. A candidate whose evaluation fails
    /// upstream is not dropped silently: it lands in a distinct
    /// "Error during analysis" bucket so the ledger still reconciles.
    pub async fn discover(
        &self,
        universe: &[String],
        sentiment: &HashMap<String, f64>,
    ) -> DiscoveryReport {
        let mut candidates = Vec::new();
        let mut rejections = RejectionLedger::default();

        for symbol in universe {
            match self.evaluate(symbol, sentiment).await {
                Ok(Verdict::Accepted(candidate)) => candidates.push(candidate),
                Ok(Verdict::Rejected(reason)) => rejections.record(reason),
                Err(e) => rejections.record(format!("Error during analysis: {e}")),
            }
        }

        let report = DiscoveryReport {
            scanned: universe.len(),
            candidates,
            rejections,
        };

        let reconciled =
            report.rejections.sum() as usize + report.candidates.len() == report.scanned;
        if !reconciled {
            tracing::warn!(
                scanned = report.scanned,
                candidates = report.candidates.len(),
                rejected = report.rejections.sum(),
                "rejection ledger does not reconcile with scanned count"
            );
        }

        tracing::info!(
            scanned = report.scanned,
            admitted = report.candidates.len(),
            rejected = report.rejections.total,
            "discovery scan complete"
        );

        report
    }

    /// Short-circuiting filter chain: market-cap floor, market-cap
    /// ceiling, volume floor, composite score.
    async fn evaluate(
        &self,
        symbol: &str,
        sentiment: &HashMap<String, f64>,
    ) -> Result<Verdict> {
        let mapping: InstrumentMapping = self.resolver.resolve(symbol).await?;
        let ticker = self.provider.get_ticker(&mapping).await?;

        let market_cap = ticker.market_cap.ok_or_else(|| {
            crate::error::CoreError::Decode(format!(
                "market cap unavailable for {}",
                mapping.instrument_id
            ))
        })?;

        if market_cap < self.filters.market_cap_floor {
            return Ok(Verdict::Rejected(REASON_MCAP_FLOOR));
        }
        if market_cap > self.filters.market_cap_ceiling {
            return Ok(Verdict::Rejected(REASON_MCAP_CEILING));
        }
        if ticker.volume_24h < self.filters.volume_floor {
            return Ok(Verdict::Rejected(REASON_VOLUME_FLOOR));
        }

        let score = composite_score(&ScoreInputs {
            market_cap,
            volume_24h: ticker.volume_24h,
            momentum_24h_pct: ticker.price_change_24h_pct.unwrap_or(0.0),
            sentiment: sentiment
                .get(&mapping.symbol)
                .copied()
                .unwrap_or(0.5),
        });

        if score < self.filters.score_threshold {
            return Ok(Verdict::Rejected(REASON_SCORE));
        }

        Ok(Verdict::Accepted(ScoredCandidate {
            symbol: mapping.symbol,
            instrument_id: mapping.instrument_id,
            score,
            market_cap,
            volume_24h: ticker.volume_24h,
            price: ticker.price,
        }))
    }
}
