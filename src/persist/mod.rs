use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{
    CloseReason, InstrumentMapping, PortfolioState, Position, PositionStatus, Side,
};

/// Durable store for mappings, positions, and the portfolio singleton.
///
/// The in-memory ledger stays authoritative at runtime; this store is the
/// restart-survivable copy. The process runs fine without it.
pub struct PgStore {
    pool: PgPool,
}

/// Portfolio singleton row, as restored at startup.
#[derive(Debug, Clone)]
pub struct StoredPortfolio {
    pub cash_balance: f64,
    pub realized_pnl: f64,
    pub daily_pnl: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub trading_suspended: bool,
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "Long",
        Side::Short => "Short",
    }
}

fn parse_side(raw: &str) -> Result<Side> {
    match raw {
        "Long" => Ok(Side::Long),
        "Short" => Ok(Side::Short),
        other => Err(CoreError::Decode(format!("unknown side {other:?}"))),
    }
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "Open",
        PositionStatus::Closed => "Closed",
    }
}

fn parse_status(raw: &str) -> Result<PositionStatus> {
    match raw {
        "Open" => Ok(PositionStatus::Open),
        "Closed" => Ok(PositionStatus::Closed),
        other => Err(CoreError::Decode(format!("unknown status {other:?}"))),
    }
}

fn reason_str(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::StopLoss => "StopLoss",
        CloseReason::TakeProfit => "TakeProfit",
        CloseReason::Manual => "Manual",
        CloseReason::RiskLimit => "RiskLimit",
    }
}

fn parse_reason(raw: &str) -> Result<CloseReason> {
    match raw {
        "StopLoss" => Ok(CloseReason::StopLoss),
        "TakeProfit" => Ok(CloseReason::TakeProfit),
        "Manual" => Ok(CloseReason::Manual),
        "RiskLimit" => Ok(CloseReason::RiskLimit),
        other => Err(CoreError::Decode(format!("unknown close reason {other:?}"))),
    }
}

impl PgStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| CoreError::Decode(format!("migration failed: {e}")))?;

        tracing::info!("connected to Postgres");

        Ok(Self { pool })
    }

    // ---- instrument mappings ----

    pub async fn save_mapping(&self, mapping: &InstrumentMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instrument_mappings
                (symbol, instrument_id, exchange_pair, market_cap_rank, resolved_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (symbol) DO UPDATE SET
                instrument_id = EXCLUDED.instrument_id,
                exchange_pair = EXCLUDED.exchange_pair,
                market_cap_rank = EXCLUDED.market_cap_rank,
                resolved_at = EXCLUDED.resolved_at
            "#,
        )
        .bind(&mapping.symbol)
        .bind(&mapping.instrument_id)
        .bind(&mapping.exchange_pair)
        .bind(mapping.market_cap_rank.map(|r| r as i32))
        .bind(mapping.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_mapping(&self, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM instrument_mappings WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_mappings(&self) -> Result<Vec<InstrumentMapping>> {
        let rows = sqlx::query(
            "SELECT symbol, instrument_id, exchange_pair, market_cap_rank, resolved_at \
             FROM instrument_mappings",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InstrumentMapping {
                symbol: row.get("symbol"),
                instrument_id: row.get("instrument_id"),
                exchange_pair: row.get("exchange_pair"),
                market_cap_rank: row.get::<Option<i32>, _>("market_cap_rank").map(|r| r as u32),
                resolved_at: row.get("resolved_at"),
            })
            .collect())
    }

    // ---- positions ----

    pub async fn save_position(&self, position: &Position) -> Result<()> {
        Self::upsert_position(&self.pool, position).await
    }

    async fn upsert_position<'e, E>(executor: E, position: &Position) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, instrument_id, exchange_pair, side,
                entry_price, quantity, stop_loss_price, take_profit_price,
                opened_at, status, close_reason, closed_at, close_price
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                close_reason = EXCLUDED.close_reason,
                closed_at = EXCLUDED.closed_at,
                close_price = EXCLUDED.close_price,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(&position.instrument_id)
        .bind(&position.exchange_pair)
        .bind(side_str(position.side))
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.stop_loss_price)
        .bind(position.take_profit_price)
        .bind(position.opened_at)
        .bind(status_str(position.status))
        .bind(position.close_reason.map(reason_str))
        .bind(position.closed_at)
        .bind(position.close_price)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, instrument_id, exchange_pair, side,
                   entry_price, quantity, stop_loss_price, take_profit_price,
                   opened_at, status, close_reason, closed_at, close_price
            FROM positions
            ORDER BY opened_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let side: String = row.get("side");
            let status: String = row.get("status");
            let close_reason: Option<String> = row.get("close_reason");

            positions.push(Position {
                id,
                symbol: row.get("symbol"),
                instrument_id: row.get("instrument_id"),
                exchange_pair: row.get("exchange_pair"),
                side: parse_side(&side)?,
                entry_price: row.get("entry_price"),
                quantity: row.get("quantity"),
                stop_loss_price: row.get("stop_loss_price"),
                take_profit_price: row.get("take_profit_price"),
                opened_at: row.get("opened_at"),
                status: parse_status(&status)?,
                close_reason: close_reason.as_deref().map(parse_reason).transpose()?,
                closed_at: row.get("closed_at"),
                close_price: row.get("close_price"),
            });
        }

        Ok(positions)
    }

    // ---- portfolio singleton ----

    pub async fn save_portfolio(&self, state: &PortfolioState) -> Result<()> {
        Self::upsert_portfolio(&self.pool, state).await
    }

    async fn upsert_portfolio<'e, E>(executor: E, state: &PortfolioState) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO portfolio
                (id, cash_balance, realized_pnl, daily_pnl, daily_reset_at, trading_suspended)
            VALUES (1, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                cash_balance = EXCLUDED.cash_balance,
                realized_pnl = EXCLUDED.realized_pnl,
                daily_pnl = EXCLUDED.daily_pnl,
                daily_reset_at = EXCLUDED.daily_reset_at,
                trading_suspended = EXCLUDED.trading_suspended,
                updated_at = NOW()
            "#,
        )
        .bind(state.cash_balance)
        .bind(state.realized_pnl)
        .bind(state.daily_pnl)
        .bind(state.daily_reset_at)
        .bind(state.trading_suspended)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn load_portfolio(&self) -> Result<Option<StoredPortfolio>> {
        let row = sqlx::query(
            "SELECT cash_balance, realized_pnl, daily_pnl, daily_reset_at, trading_suspended \
             FROM portfolio WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredPortfolio {
            cash_balance: row.get("cash_balance"),
            realized_pnl: row.get("realized_pnl"),
            daily_pnl: row.get("daily_pnl"),
            daily_reset_at: row.get("daily_reset_at"),
            trading_suspended: row.get("trading_suspended"),
        }))
    }

    /// Durable half of an atomic position transition (open or close):
    /// position and portfolio written in one transaction, so a restart
    /// never observes a half-applied state.
    pub async fn save_trade(&self, position: &Position, state: &PortfolioState) -> Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        Self::upsert_position(&mut *tx, position).await?;
        Self::upsert_portfolio(&mut *tx, state).await?;

        tx.commit().await?;
        Ok(())
    }
}
