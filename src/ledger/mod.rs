use chrono::{DateTime, Days, Duration, Utc};
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::error::{CoreError, Result};
use crate::models::{CloseReason, PortfolioState, Position, PositionStatus, Side};

/// Everything needed to open a simulated position. Stop and take-profit
/// are fixed here and never drift afterwards.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub symbol: String,
    pub instrument_id: String,
    pub exchange_pair: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
}

/// Authoritative record of cash, open positions, and closed trade history.
///
/// The ledger itself is single-threaded state; callers wrap it in
/// `Arc<Mutex<…>>` so every mutation (open, close, daily roll) is atomic
/// with respect to every other — read-balance-then-write-balance never
/// interleaves.
pub struct PortfolioLedger {
    cash_balance: f64,
    positions: Vec<Position>,
    realized_pnl: f64,
    daily_pnl: f64,
    daily_reset_at: DateTime<Utc>,
    trading_suspended: bool,
    risk: RiskConfig,
}

impl PortfolioLedger {
    pub fn new(initial_cash: f64, risk: RiskConfig) -> Self {
        Self {
            cash_balance: initial_cash,
            positions: Vec::new(),
            realized_pnl: 0.0,
            daily_pnl: 0.0,
            daily_reset_at: next_utc_midnight(Utc::now()),
            trading_suspended: false,
            risk,
        }
    }

    /// Rebuild from persisted state (restart path).
    pub fn restore(
        cash_balance: f64,
        realized_pnl: f64,
        daily_pnl: f64,
        daily_reset_at: DateTime<Utc>,
        trading_suspended: bool,
        positions: Vec<Position>,
        risk: RiskConfig,
    ) -> Self {
        tracing::info!(
            cash = cash_balance,
            positions = positions.len(),
            "restored portfolio from persistence"
        );
        Self {
            cash_balance,
            positions,
            realized_pnl,
            daily_pnl,
            daily_reset_at,
            trading_suspended,
            risk,
        }
    }

    pub fn open_position(&mut self, spec: OpenSpec) -> Result<Position> {
        self.open_position_at(spec, Utc::now())
    }

    /// Open with an explicit timestamp (deterministic in tests).
    ///
    /// Check order matters for the caller-visible rejection reason:
    /// suspension, then request validity, then the size limit, then funds.
    pub fn open_position_at(&mut self, spec: OpenSpec, now: DateTime<Utc>) -> Result<Position> {
        self.roll_daily_window_at(now);

        if self.trading_suspended {
            return Err(CoreError::LimitExceeded(format!(
                "trading suspended after daily loss limit, resumes at {}",
                self.daily_reset_at
            )));
        }

        validate_spec(&spec)?;

        let cost = spec.entry_price * spec.quantity;
        let max_cost = self.risk.max_position_size_fraction * self.portfolio_value();
        if cost > max_cost {
            return Err(CoreError::LimitExceeded(format!(
                "position cost ${cost:.2} exceeds max ${max_cost:.2} ({:.1}% of portfolio)",
                self.risk.max_position_size_fraction * 100.0
            )));
        }

        if cost > self.cash_balance {
            return Err(CoreError::InsufficientFunds {
                required: cost,
                available: self.cash_balance,
            });
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol: spec.symbol,
            instrument_id: spec.instrument_id,
            exchange_pair: spec.exchange_pair,
            side: spec.side,
            entry_price: spec.entry_price,
            quantity: spec.quantity,
            stop_loss_price: spec.stop_loss_price,
            take_profit_price: spec.take_profit_price,
            opened_at: now,
            status: PositionStatus::Open,
            close_reason: None,
            closed_at: None,
            close_price: None,
        };

        self.cash_balance -= cost;
        self.positions.push(position.clone());

        tracing::info!(
            symbol = %position.symbol,
            instrument_id = %position.instrument_id,
            side = ?position.side,
            entry = position.entry_price,
            quantity = position.quantity,
            "position opened"
        );

        Ok(position)
    }

    pub fn close_position(
        &mut self,
        id: Uuid,
        reason: CloseReason,
        price: f64,
    ) -> Result<Position> {
        self.close_position_at(id, reason, price, Utc::now())
    }

    /// Close exactly once: status, close price, reason, and timestamp are
    /// set together in one mutation under the owning lock.
    pub fn close_position_at(
        &mut self,
        id: Uuid,
        reason: CloseReason,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Position> {
        self.roll_daily_window_at(now);

        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("position {id}")))?;

        if position.status == PositionStatus::Closed {
            return Err(CoreError::InvalidOrder(format!("position {id} already closed")));
        }

        let pnl = position.pnl_at(price);
        let credit = match position.side {
            Side::Long => price * position.quantity,
            Side::Short => position.cost_basis() + pnl,
        };
        let credit = if credit < 0.0 {
            // A short past 2x entry would owe more than its margin; the
            // simulation absorbs the excess rather than going negative.
            tracing::warn!(
                symbol = %position.symbol,
                pnl,
                "short close exceeded margin, crediting zero"
            );
            0.0
        } else {
            credit
        };

        position.status = PositionStatus::Closed;
        position.close_reason = Some(reason);
        position.close_price = Some(price);
        position.closed_at = Some(now);

        let closed = position.clone();

        self.cash_balance += credit;
        self.realized_pnl += pnl;
        self.daily_pnl += pnl;

        tracing::info!(
            symbol = %closed.symbol,
            reason = ?reason,
            close_price = price,
            pnl,
            daily_pnl = self.daily_pnl,
            "position closed"
        );

        Ok(closed)
    }

    /// Open positions in stable id order, so multi-position operations
    /// (evaluation, forced closes) are reproducible.
    pub fn open_positions(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|p| p.id);
        open
    }

    pub fn position(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    /// Cash plus the cost basis locked in open positions. Deliberately
    /// price-feed-free so limit checks never block on the network.
    pub fn portfolio_value(&self) -> f64 {
        let open_basis: f64 = self
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.cost_basis())
            .sum();
        self.cash_balance + open_basis
    }

    /// Whether realized losses today breach the configured fraction.
    pub fn daily_loss_breached(&self) -> bool {
        self.daily_pnl <= -(self.risk.max_daily_loss_fraction * self.portfolio_value())
    }

    /// Stop accepting opens until the next daily boundary.
    pub fn suspend_trading(&mut self) {
        if !self.trading_suspended {
            tracing::warn!(
                daily_pnl = self.daily_pnl,
                resumes_at = %self.daily_reset_at,
                "trading suspended by daily loss limit"
            );
        }
        self.trading_suspended = true;
    }

    pub fn is_suspended(&self) -> bool {
        self.trading_suspended
    }

    pub fn roll_daily_window(&mut self) {
        self.roll_daily_window_at(Utc::now());
    }

    /// Reset the daily accumulator (and any suspension) once the UTC
    /// midnight boundary has passed.
    pub fn roll_daily_window_at(&mut self, now: DateTime<Utc>) {
        if now >= self.daily_reset_at {
            tracing::info!(
                previous_daily_pnl = self.daily_pnl,
                "daily window rolled"
            );
            self.daily_pnl = 0.0;
            self.trading_suspended = false;
            self.daily_reset_at = next_utc_midnight(now);
        }
    }

    pub fn state(&self) -> PortfolioState {
        PortfolioState {
            cash_balance: self.cash_balance,
            open_positions: self.open_positions(),
            realized_pnl: self.realized_pnl,
            daily_pnl: self.daily_pnl,
            daily_reset_at: self.daily_reset_at,
            trading_suspended: self.trading_suspended,
        }
    }

    #[cfg(test)]
    pub fn set_daily_pnl(&mut self, pnl: f64) {
        self.daily_pnl = pnl;
    }

    #[cfg(test)]
    pub fn set_daily_reset_at(&mut self, at: DateTime<Utc>) {
        self.daily_reset_at = at;
    }
}

fn validate_spec(spec: &OpenSpec) -> Result<()> {
    if spec.quantity <= 0.0 || !spec.quantity.is_finite() {
        return Err(CoreError::InvalidOrder(format!(
            "quantity must be positive, got {}",
            spec.quantity
        )));
    }
    if spec.entry_price <= 0.0 || !spec.entry_price.is_finite() {
        return Err(CoreError::InvalidOrder(format!(
            "entry price must be positive, got {}",
            spec.entry_price
        )));
    }

    let ok = match spec.side {
        Side::Long => {
            spec.stop_loss_price < spec.entry_price && spec.take_profit_price > spec.entry_price
        }
        Side::Short => {
            spec.stop_loss_price > spec.entry_price && spec.take_profit_price < spec.entry_price
        }
    };
    if !ok {
        return Err(CoreError::InvalidOrder(format!(
            "stop {} / take {} on the wrong side of entry {} for a {:?}",
            spec.stop_loss_price, spec.take_profit_price, spec.entry_price, spec.side
        )));
    }
    Ok(())
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Days::new(1);
    match tomorrow.and_hms_opt(0, 0, 0) {
        Some(naive) => DateTime::from_naive_utc_and_offset(naive, Utc),
        None => now + Duration::days(1),
    }
}
