use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::domain::{
    AlertRule, BrowserNotification, ExecutionMode, MarketType, Monitor, NotificationConfig,
    NotificationPayload, OrderJob, OrderKind, OrderState, Position, PositionKey, PositionSide,
    SignalType, Trade, TradeAction,
};
use crate::error::{PipelineError, Result};

use super::store::Store;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_enum<T>(row: &PgRow, column: &str) -> Result<T>
where
    for<'a> T: TryFrom<&'a str, Error = String>,
{
    let text: String = row.try_get(column)?;
    T::try_from(text.as_str()).map_err(PipelineError::Internal)
}

fn row_to_order(row: &PgRow) -> Result<OrderJob> {
    Ok(OrderJob {
        id: row.try_get("id")?,
        client_order_id: row.try_get("client_order_id")?,
        strategy_id: row.try_get("strategy_id")?,
        account_id: row.try_get("account_id")?,
        symbol: row.try_get("symbol")?,
        market: parse_enum::<MarketType>(row, "market")?,
        signal: parse_enum::<SignalType>(row, "signal")?,
        kind: parse_enum::<OrderKind>(row, "kind")?,
        amount: row.try_get("amount")?,
        price: row.try_get("price")?,
        mode: parse_enum::<ExecutionMode>(row, "mode")?,
        priority: row.try_get("priority")?,
        state: parse_enum::<OrderState>(row, "state")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claimed_by: row.try_get("claimed_by")?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        raw_response: row.try_get("raw_response")?,
        filled_amount: row.try_get("filled_amount")?,
        avg_fill_price: row.try_get("avg_fill_price")?,
        signal_at: row.try_get("signal_at")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        sent_at: row.try_get("sent_at")?,
        executed_at: row.try_get("executed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const ORDER_COLUMNS: &str = "id, client_order_id, strategy_id, account_id, symbol, market, signal, \
     kind, amount, price, mode, priority, state, attempts, max_attempts, last_error, \
     next_attempt_at, claimed_by, exchange_order_id, raw_response, filled_amount, \
     avg_fill_price, signal_at, created_at, processed_at, sent_at, executed_at, updated_at";

fn row_to_position(row: &PgRow) -> Result<Position> {
    Ok(Position {
        id: row.try_get("id")?,
        strategy_id: row.try_get("strategy_id")?,
        symbol: row.try_get("symbol")?,
        side: parse_enum::<PositionSide>(row, "side")?,
        size: row.try_get("size")?,
        entry_price: row.try_get("entry_price")?,
        current_price: row.try_get("current_price")?,
        high_watermark: row.try_get("high_watermark")?,
        low_watermark: row.try_get("low_watermark")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        pnl_percent: row.try_get("pnl_percent")?,
        equity: row.try_get("equity")?,
        opened_at: row.try_get("opened_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_alert(row: &PgRow) -> Result<AlertRule> {
    let notification: serde_json::Value = row.try_get("notification")?;
    Ok(AlertRule {
        id: row.try_get("id")?,
        position_id: row.try_get("position_id")?,
        kind: parse_enum(row, "kind")?,
        threshold: row.try_get("threshold")?,
        is_active: row.try_get("is_active")?,
        is_triggered: row.try_get("is_triggered")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        trigger_count: row.try_get("trigger_count")?,
        repeat_interval_min: row.try_get("repeat_interval_min")?,
        notification: serde_json::from_value::<NotificationConfig>(notification)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_monitor(row: &PgRow) -> Result<Monitor> {
    let position_ids: serde_json::Value = row.try_get("position_ids")?;
    let notification: serde_json::Value = row.try_get("notification")?;
    Ok(Monitor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        position_ids: serde_json::from_value(position_ids)?,
        interval_min: row.try_get("interval_min")?,
        is_active: row.try_get("is_active")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
        last_result: row.try_get("last_result")?,
        run_count: row.try_get("run_count")?,
        notification: serde_json::from_value::<NotificationConfig>(notification)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_order(&self, job: &OrderJob) -> Result<OrderJob> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO order_jobs (
                client_order_id, strategy_id, account_id, symbol, market, signal,
                kind, amount, price, mode, priority, state, attempts, max_attempts,
                signal_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&job.client_order_id)
        .bind(job.strategy_id)
        .bind(job.account_id)
        .bind(&job.symbol)
        .bind(job.market.as_str())
        .bind(job.signal.as_str())
        .bind(job.kind.as_str())
        .bind(job.amount)
        .bind(job.price)
        .bind(job.mode.as_str())
        .bind(job.priority)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.signal_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row_to_order(&row)
    }

    async fn get_order(&self, id: i64) -> Result<Option<OrderJob>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM order_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn claim_next_order(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderJob>> {
        // SKIP LOCKED makes concurrent claims race-free: at most one worker
        // sees any given pending row.
        let row = sqlx::query(&format!(
            r#"
            UPDATE order_jobs
            SET state = 'processing', claimed_by = $1, processed_at = $2, updated_at = $2
            WHERE id = (
                SELECT id FROM order_jobs
                WHERE state = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn update_order(&self, job: &OrderJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE order_jobs SET
                state = $2, attempts = $3, last_error = $4, next_attempt_at = $5,
                claimed_by = $6, exchange_order_id = $7, raw_response = $8,
                filled_amount = $9, avg_fill_price = $10, processed_at = $11,
                sent_at = $12, executed_at = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(job.next_attempt_at)
        .bind(&job.claimed_by)
        .bind(&job.exchange_order_id)
        .bind(&job.raw_response)
        .bind(job.filled_amount)
        .bind(job.avg_fill_price)
        .bind(job.processed_at)
        .bind(job.sent_at)
        .bind(job.executed_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("order {}", job.id)));
        }
        Ok(())
    }

    async fn try_cancel_order(&self, id: i64) -> Result<OrderJob> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE order_jobs
            SET state = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND state = 'pending'
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row_to_order(&row);
        }

        match self.get_order(id).await? {
            Some(job) => Err(PipelineError::InvalidState {
                operation: "cancel".into(),
                state: job.state.to_string(),
            }),
            None => Err(PipelineError::NotFound(format!("order {}", id))),
        }
    }

    async fn count_orders_by_state(&self, state: OrderState) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM order_jobs WHERE state = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn find_stuck_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<OrderJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM order_jobs
            WHERE state IN ('processing', 'sent') AND updated_at < $1
            ORDER BY updated_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_order).collect()
    }

    async fn insert_trade_once(&self, trade: &Trade) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                trade_uid, order_id, strategy_id, account_id, symbol, side, action,
                price, amount, value, commission, profit, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (trade_uid) DO NOTHING
            "#,
        )
        .bind(&trade.trade_uid)
        .bind(trade.order_id)
        .bind(trade.strategy_id)
        .bind(trade.account_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.action.as_str())
        .bind(trade.price)
        .bind(trade.amount)
        .bind(trade.value)
        .bind(trade.commission)
        .bind(trade.profit)
        .bind(trade.executed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_position(&self, key: &PositionKey) -> Result<Option<Position>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM positions
            WHERE strategy_id IS NOT DISTINCT FROM $1 AND symbol = $2 AND side = $3
            "#,
        )
        .bind(key.strategy_id)
        .bind(&key.symbol)
        .bind(key.side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_position).transpose()
    }

    async fn get_position_by_id(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_position).transpose()
    }

    async fn upsert_position(&self, position: &Position) -> Result<Position> {
        let row = sqlx::query(
            r#"
            INSERT INTO positions (
                strategy_id, symbol, side, size, entry_price, current_price,
                high_watermark, low_watermark, unrealized_pnl, pnl_percent, equity,
                opened_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (strategy_id, symbol, side) DO UPDATE SET
                size = EXCLUDED.size,
                entry_price = EXCLUDED.entry_price,
                current_price = EXCLUDED.current_price,
                high_watermark = EXCLUDED.high_watermark,
                low_watermark = EXCLUDED.low_watermark,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                pnl_percent = EXCLUDED.pnl_percent,
                equity = EXCLUDED.equity,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(position.strategy_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.size)
        .bind(position.entry_price)
        .bind(position.current_price)
        .bind(position.high_watermark)
        .bind(position.low_watermark)
        .bind(position.unrealized_pnl)
        .bind(position.pnl_percent)
        .bind(position.equity)
        .bind(position.opened_at)
        .bind(position.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row_to_position(&row)
    }

    async fn delete_position(&self, key: &PositionKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM positions
            WHERE strategy_id IS NOT DISTINCT FROM $1 AND symbol = $2 AND side = $3
            "#,
        )
        .bind(key.strategy_id)
        .bind(&key.symbol)
        .bind(key.side.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_position).collect()
    }

    async fn list_positions_by_symbol(&self, symbol: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE symbol = $1 ORDER BY id")
            .bind(symbol)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_position).collect()
    }

    async fn insert_alert(&self, rule: &AlertRule) -> Result<AlertRule> {
        let row = sqlx::query(
            r#"
            INSERT INTO alert_rules (
                position_id, kind, threshold, is_active, is_triggered,
                last_triggered_at, trigger_count, repeat_interval_min, notification,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(rule.position_id)
        .bind(rule.kind.as_str())
        .bind(rule.threshold)
        .bind(rule.is_active)
        .bind(rule.is_triggered)
        .bind(rule.last_triggered_at)
        .bind(rule.trigger_count)
        .bind(rule.repeat_interval_min)
        .bind(serde_json::to_value(&rule.notification)?)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row_to_alert(&row)
    }

    async fn update_alert(&self, rule: &AlertRule) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE alert_rules SET
                position_id = $2, kind = $3, threshold = $4, is_active = $5,
                is_triggered = $6, last_triggered_at = $7, trigger_count = $8,
                repeat_interval_min = $9, notification = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(rule.position_id)
        .bind(rule.kind.as_str())
        .bind(rule.threshold)
        .bind(rule.is_active)
        .bind(rule.is_triggered)
        .bind(rule.last_triggered_at)
        .bind(rule.trigger_count)
        .bind(rule.repeat_interval_min)
        .bind(serde_json::to_value(&rule.notification)?)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("alert {}", rule.id)));
        }
        Ok(())
    }

    async fn delete_alert(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM alert_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_alert(&self, id: i64) -> Result<Option<AlertRule>> {
        let row = sqlx::query("SELECT * FROM alert_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_alert).transpose()
    }

    async fn list_alerts(&self) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT * FROM alert_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_alert).collect()
    }

    async fn list_active_alerts(&self) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT * FROM alert_rules WHERE is_active ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_alert).collect()
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<Monitor> {
        let row = sqlx::query(
            r#"
            INSERT INTO monitors (
                name, position_ids, interval_min, is_active, last_run_at, next_run_at,
                last_result, run_count, notification, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&monitor.name)
        .bind(serde_json::to_value(&monitor.position_ids)?)
        .bind(monitor.interval_min)
        .bind(monitor.is_active)
        .bind(monitor.last_run_at)
        .bind(monitor.next_run_at)
        .bind(&monitor.last_result)
        .bind(monitor.run_count)
        .bind(serde_json::to_value(&monitor.notification)?)
        .bind(monitor.created_at)
        .bind(monitor.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row_to_monitor(&row)
    }

    async fn update_monitor(&self, monitor: &Monitor) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitors SET
                name = $2, position_ids = $3, interval_min = $4, is_active = $5,
                last_run_at = $6, next_run_at = $7, last_result = $8, run_count = $9,
                notification = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(monitor.id)
        .bind(&monitor.name)
        .bind(serde_json::to_value(&monitor.position_ids)?)
        .bind(monitor.interval_min)
        .bind(monitor.is_active)
        .bind(monitor.last_run_at)
        .bind(monitor.next_run_at)
        .bind(&monitor.last_result)
        .bind(monitor.run_count)
        .bind(serde_json::to_value(&monitor.notification)?)
        .bind(monitor.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("monitor {}", monitor.id)));
        }
        Ok(())
    }

    async fn delete_monitor(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM monitors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_monitor(&self, id: i64) -> Result<Option<Monitor>> {
        let row = sqlx::query("SELECT * FROM monitors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_monitor).transpose()
    }

    async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        let rows = sqlx::query("SELECT * FROM monitors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_monitor).collect()
    }

    async fn due_monitors(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Monitor>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM monitors
            WHERE is_active AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_monitor).collect()
    }

    async fn insert_notification(&self, payload: &NotificationPayload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (symbol, kind, title, message, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(&payload.symbol)
        .bind(&payload.kind)
        .bind(&payload.title)
        .bind(&payload.message)
        .bind(&payload.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications(&self, limit: i64) -> Result<Vec<BrowserNotification>> {
        let rows = sqlx::query(
            "SELECT * FROM notifications ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BrowserNotification {
                    id: row.try_get("id")?,
                    symbol: row.try_get("symbol")?,
                    kind: row.try_get("kind")?,
                    title: row.try_get("title")?,
                    message: row.try_get("message")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
