use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::ledger::PortfolioLedger;
use crate::market::MarketDataProvider;
use crate::models::{CloseReason, InstrumentMapping, Position};
use crate::persist::PgStore;

/// What one evaluation cycle did, for logging and tests.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub evaluated: usize,
    pub closed: Vec<Position>,
    pub fetch_failures: usize,
    pub risk_limit_forced: bool,
}

/// Drives stop-loss / take-profit / portfolio-limit enforcement over the
/// open positions.
///
/// Prices are always fetched by each position's stored mapping — never by
/// re-resolving the symbol — so a later resolver re-mapping cannot change
/// the price source of a position that is already open.
pub struct RiskMonitor {
    provider: Arc<MarketDataProvider>,
    ledger: Arc<Mutex<PortfolioLedger>>,
    store: Option<Arc<PgStore>>,
    shutdown: Arc<AtomicBool>,
}

impl RiskMonitor {
    pub fn new(
        provider: Arc<MarketDataProvider>,
        ledger: Arc<Mutex<PortfolioLedger>>,
        store: Option<Arc<PgStore>>,
    ) -> Self {
        Self {
            provider,
            ledger,
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between positions; an in-flight decided close always
    /// completes its ledger write before the flag is honored.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Recurring driver. Cycles are strictly sequential (a new tick is
    /// skipped while the previous cycle runs), so no two cycles ever
    /// mutate the ledger concurrently.
    pub async fn run_loop(&self, interval_secs: u64, mut stop: watch::Receiver<bool>) {
        tracing::info!(interval_secs, "risk monitor loop starting");

        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        self.shutdown.store(true, Ordering::Relaxed);
                        tracing::info!("risk monitor loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let outcome = self.run_cycle().await;
                    if !outcome.closed.is_empty() || outcome.fetch_failures > 0 {
                        tracing::info!(
                            evaluated = outcome.evaluated,
                            closed = outcome.closed.len(),
                            fetch_failures = outcome.fetch_failures,
                            forced = outcome.risk_limit_forced,
                            "monitor cycle done"
                        );
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(Utc::now()).await
    }

    /// One full evaluation pass with an explicit timestamp.
    ///
    /// Positions are visited in stable id order so forced closes are
    /// reproducible. A single position's price-fetch failure is isolated:
    /// it stays OPEN with protections intact and the cycle continues.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        let (suspended, open) = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.roll_daily_window_at(now);
            if ledger.daily_loss_breached() {
                ledger.suspend_trading();
            }
            (ledger.is_suspended(), ledger.open_positions())
        };

        if open.is_empty() {
            return outcome;
        }

        if suspended {
            outcome.risk_limit_forced = true;
            self.force_close_all(&open, now, &mut outcome).await;
            return outcome;
        }

        for position in &open {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown observed mid-cycle, remaining positions defer");
                break;
            }

            outcome.evaluated += 1;

            let price = match self.fetch_price(position).await {
                Ok(price) => price,
                Err(e) => {
                    // Stale data: visibly OPEN, never silently closed
                    tracing::warn!(
                        symbol = %position.symbol,
                        instrument_id = %position.instrument_id,
                        error = %e,
                        "price fetch failed, position stays protected until next cycle"
                    );
                    outcome.fetch_failures += 1;
                    continue;
                }
            };

            if let Some(reason) = position.triggered_exit(price) {
                self.close_and_persist(position, reason, price, now, &mut outcome)
                    .await;

                // A close can tip the daily accumulator over the limit;
                // the rest of the book force-closes in this same cycle.
                let breached = {
                    let mut ledger = self.ledger.lock().unwrap();
                    if ledger.daily_loss_breached() {
                        ledger.suspend_trading();
                        true
                    } else {
                        false
                    }
                };
                if breached {
                    outcome.risk_limit_forced = true;
                    let remaining = {
                        let ledger = self.ledger.lock().unwrap();
                        ledger.open_positions()
                    };
                    self.force_close_all(&remaining, now, &mut outcome).await;
                    return outcome;
                }
            }
        }

        outcome
    }

    async fn force_close_all(
        &self,
        positions: &[Position],
        now: DateTime<Utc>,
        outcome: &mut CycleOutcome,
    ) {
        for position in positions {
            match self.fetch_price(position).await {
                Ok(price) => {
                    self.close_and_persist(position, CloseReason::RiskLimit, price, now, outcome)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        symbol = %position.symbol,
                        error = %e,
                        "forced close deferred to next cycle, price unavailable"
                    );
                    outcome.fetch_failures += 1;
                }
            }
        }
    }

    async fn close_and_persist(
        &self,
        position: &Position,
        reason: CloseReason,
        price: f64,
        now: DateTime<Utc>,
        outcome: &mut CycleOutcome,
    ) {
        let closed = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.close_position_at(position.id, reason, price, now)
        };

        match closed {
            Ok(closed) => {
                if let Some(store) = &self.store {
                    let state = { self.ledger.lock().unwrap().state() };
                    if let Err(e) = store.save_trade(&closed, &state).await {
                        tracing::warn!(
                            position = %closed.id,
                            error = %e,
                            "failed to persist close, ledger remains authoritative"
                        );
                    }
                }
                outcome.closed.push(closed);
            }
            Err(e) => {
                tracing::error!(position = %position.id, error = %e, "close rejected");
            }
        }
    }

    async fn fetch_price(&self, position: &Position) -> crate::error::Result<f64> {
        let mapping = InstrumentMapping {
            symbol: position.symbol.clone(),
            instrument_id: position.instrument_id.clone(),
            exchange_pair: position.exchange_pair.clone(),
            market_cap_rank: None,
            resolved_at: position.opened_at,
        };
        self.provider.get_price(&mapping).await
    }
}
