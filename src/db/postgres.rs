use crate::models::{Direction, ExitReason, Position, PositionStatus, StrategyId};
use crate::store::{CloseUpdate, PositionQuery, PositionStore};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

/// Postgres-backed position store
///
/// The conditional insert relies on the partial unique index
/// `positions_one_open` over (symbol, strategy_id) WHERE status = 'Open'.
pub struct PostgresStore {
    pool: PgPool,
}

const POSITION_COLUMNS: &str = r#"
    id, symbol, strategy_id, direction, entry_price, stop_loss, take_profit,
    quantity, leverage, status, entry_time, exit_time, exit_price, pnl, exit_reason
"#;

impl PostgresStore {
    /// Connect and run migrations
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres position store");

        Ok(Self { pool })
    }
}

fn decimal_to_f64(value: rust_decimal::Decimal) -> Result<f64> {
    Ok(value.to_string().parse()?)
}

fn parse_direction(s: &str) -> Result<Direction> {
    match s {
        "BUY" => Ok(Direction::Buy),
        "SELL" => Ok(Direction::Sell),
        _ => Err(format!("Invalid direction {}", s).into()),
    }
}

fn parse_status(s: &str) -> Result<PositionStatus> {
    match s {
        "Open" => Ok(PositionStatus::Open),
        "Closed" => Ok(PositionStatus::Closed),
        _ => Err(format!("Invalid position status {}", s).into()),
    }
}

fn parse_exit_reason(s: Option<&str>) -> Result<Option<ExitReason>> {
    match s {
        Some("StopLoss") => Ok(Some(ExitReason::StopLoss)),
        Some("TakeProfit") => Ok(Some(ExitReason::TakeProfit)),
        Some("Manual") => Ok(Some(ExitReason::Manual)),
        None => Ok(None),
        Some(other) => Err(format!("Invalid exit reason {}", other).into()),
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Buy => "BUY",
        Direction::Sell => "SELL",
    }
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let entry_price: rust_decimal::Decimal = row.try_get("entry_price")?;
    let stop_loss: rust_decimal::Decimal = row.try_get("stop_loss")?;
    let take_profit: rust_decimal::Decimal = row.try_get("take_profit")?;
    let quantity: rust_decimal::Decimal = row.try_get("quantity")?;
    let leverage: Option<i32> = row.try_get("leverage")?;
    let exit_price: Option<rust_decimal::Decimal> = row.try_get("exit_price")?;
    let pnl: Option<rust_decimal::Decimal> = row.try_get("pnl")?;
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let entry_time: DateTime<Utc> = row.try_get("entry_time")?;
    let exit_time: Option<DateTime<Utc>> = row.try_get("exit_time")?;

    Ok(Position {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        strategy_id: StrategyId::new(row.try_get::<String, _>("strategy_id")?),
        direction: parse_direction(&direction)?,
        entry_price: decimal_to_f64(entry_price)?,
        stop_loss: decimal_to_f64(stop_loss)?,
        take_profit: decimal_to_f64(take_profit)?,
        quantity: decimal_to_f64(quantity)?,
        leverage: leverage.map(|l| l.max(0) as u32),
        status: parse_status(&status)?,
        entry_time,
        exit_time,
        exit_price: exit_price.map(decimal_to_f64).transpose()?,
        pnl: pnl.map(decimal_to_f64).transpose()?,
        exit_reason: parse_exit_reason(exit_reason.as_deref())?,
    })
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn insert_if_absent(&self, position: &Position) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, strategy_id, direction, entry_price, stop_loss,
                take_profit, quantity, leverage, status, entry_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(position.strategy_id.as_str())
        .bind(direction_str(position.direction))
        .bind(position.entry_price)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.quantity)
        .bind(position.leverage.map(|l| l as i32))
        .bind(position.status.as_str())
        .bind(position.entry_time)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        tracing::debug!(
            "Insert position {} for {} / {}: {}",
            position.id,
            position.symbol,
            position.strategy_id,
            if inserted { "stored" } else { "conflict" }
        );
        Ok(inserted)
    }

    async fn close_if_open(&self, id: Uuid, update: &CloseUpdate) -> Result<Option<Position>> {
        let sql = format!(
            r#"
            UPDATE positions
            SET status = 'Closed', exit_price = $2, exit_time = $3, pnl = $4,
                exit_reason = $5, updated_at = NOW()
            WHERE id = $1 AND status = 'Open'
            RETURNING {}
            "#,
            POSITION_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(update.exit_price)
            .bind(update.exit_time)
            .bind(update.pnl)
            .bind(update.reason.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(position_from_row).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let sql = format!("SELECT {} FROM positions WHERE id = $1", POSITION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.as_ref().map(position_from_row).transpose()
    }

    async fn query(&self, query: &PositionQuery) -> Result<Vec<Position>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM positions
            WHERE ($1::TEXT IS NULL OR symbol = $1)
              AND ($2::TEXT IS NULL OR strategy_id = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY entry_time ASC
            "#,
            POSITION_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(query.symbol.as_deref())
            .bind(query.strategy_id.as_ref().map(|s| s.as_str()))
            .bind(query.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(position_from_row).collect()
    }
}
