use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::Store;
use crate::domain::{
    OrderFill, OrderJob, PortfolioSummary, Position, PositionKey, Trade, TradeAction,
};
use crate::error::Result;

/// Position ledger: the only writer of position rows. Trades apply exactly
/// once (keyed by `trade_uid`); writers serialize per position key.
pub struct PositionLedger {
    store: Arc<dyn Store>,
    key_locks: DashMap<PositionKey, Arc<Mutex<()>>>,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            key_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &PositionKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Turn an executed order into a trade and apply it. The trade uid is
    /// derived from the client order id, so a worker and the watchdog
    /// applying the same fill collapse into one application.
    pub async fn apply_order_fill(&self, job: &OrderJob, fill: &OrderFill) -> Result<bool> {
        let mut trade = Trade::new(
            Some(job.id),
            job.strategy_id,
            job.account_id,
            job.symbol.clone(),
            job.signal.side(),
            job.signal.action(),
            fill.avg_price,
            fill.filled_amount,
            fill.commission,
            fill.executed_at,
        );
        trade.trade_uid = format!("fill-{}", job.client_order_id);
        self.apply_trade(trade).await
    }

    /// Apply a trade to its position. Returns false when the trade uid was
    /// already recorded (duplicate delivery).
    pub async fn apply_trade(&self, mut trade: Trade) -> Result<bool> {
        let key = PositionKey {
            strategy_id: trade.strategy_id,
            symbol: trade.symbol.clone(),
            side: trade.side,
        };
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let position = self.store.get_position(&key).await?;

        match trade.action {
            TradeAction::Open => {
                if !self.store.insert_trade_once(&trade).await? {
                    debug!(trade_uid = %trade.trade_uid, "duplicate trade ignored");
                    return Ok(false);
                }

                let position = match position {
                    Some(mut p) => {
                        p.add(trade.price, trade.amount, now);
                        p
                    }
                    None => Position::open(&key, trade.price, trade.amount, now),
                };
                let position = self.store.upsert_position(&position).await?;
                info!(
                    position = %key,
                    size = %position.size,
                    entry = %position.entry_price,
                    "position opened/increased"
                );
            }
            TradeAction::Close => {
                match position {
                    Some(mut p) => {
                        // Closing more than is open clamps to the open size
                        let effective = if trade.amount > p.size {
                            warn!(
                                position = %key,
                                requested = %trade.amount,
                                open = %p.size,
                                "close exceeds open size, clamping"
                            );
                            p.size
                        } else {
                            trade.amount
                        };
                        let realized = (trade.price - p.entry_price)
                            * effective
                            * p.side.sign();
                        trade.amount = effective;
                        trade.value = trade.price * effective;
                        trade.profit = Some(realized - trade.commission);

                        if !self.store.insert_trade_once(&trade).await? {
                            debug!(trade_uid = %trade.trade_uid, "duplicate trade ignored");
                            return Ok(false);
                        }

                        p.reduce(trade.price, effective, now);
                        if p.is_flat() {
                            self.store.delete_position(&key).await?;
                            info!(position = %key, realized = %realized, "position closed");
                        } else {
                            self.store.upsert_position(&p).await?;
                            info!(
                                position = %key,
                                size = %p.size,
                                realized = %realized,
                                "position reduced"
                            );
                        }
                    }
                    None => {
                        // Venue executed but we hold nothing: keep the audit
                        // record, leave positions untouched
                        warn!(position = %key, trade_uid = %trade.trade_uid,
                              "closing trade with no open position");
                        if !self.store.insert_trade_once(&trade).await? {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Mark all positions on `symbol` to the new price. Unknown symbols are
    /// a no-op.
    pub async fn apply_price_tick(&self, symbol: &str, price: Decimal) -> Result<()> {
        let positions = self.store.list_positions_by_symbol(symbol).await?;
        for stale in positions {
            let key = stale.key();
            let lock = self.lock_for(&key);
            let _guard = lock.lock().await;

            // Re-read under the lock; a trade may have landed since the list
            let Some(mut position) = self.store.get_position(&key).await? else {
                continue;
            };
            position.apply_price(price, Utc::now());
            self.store.upsert_position(&position).await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self, key: &PositionKey) -> Result<Option<Position>> {
        self.store.get_position(key).await
    }

    pub async fn list(&self) -> Result<Vec<Position>> {
        self.store.list_positions().await
    }

    pub async fn summary(&self) -> Result<PortfolioSummary> {
        let positions = self.store.list_positions().await?;
        Ok(PortfolioSummary::from_positions(&positions))
    }
}
