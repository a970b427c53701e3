use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::domain::{
    AlertRule, BrowserNotification, Monitor, NotificationPayload, OrderJob, OrderState, Position,
    PositionKey, Trade,
};
use crate::error::{PipelineError, Result};

use super::store::Store;

#[derive(Default)]
struct Inner {
    orders: HashMap<i64, OrderJob>,
    trades: Vec<Trade>,
    trade_uids: HashSet<String>,
    positions: HashMap<i64, Position>,
    alerts: HashMap<i64, AlertRule>,
    monitors: HashMap<i64, Monitor>,
    notifications: Vec<BrowserNotification>,
    next_order_id: i64,
    next_trade_id: i64,
    next_position_id: i64,
    next_alert_id: i64,
    next_monitor_id: i64,
    next_notification_id: i64,
}

/// In-memory store for tests and dry-run mode. One mutex over all state
/// makes every operation, including the claim, atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trades recorded so far (test inspection)
    pub async fn trades(&self) -> Vec<Trade> {
        self.inner.lock().await.trades.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_order(&self, job: &OrderJob) -> Result<OrderJob> {
        let mut inner = self.inner.lock().await;
        inner.next_order_id += 1;
        let mut job = job.clone();
        job.id = inner.next_order_id;
        inner.orders.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_order(&self, id: i64) -> Result<Option<OrderJob>> {
        Ok(self.inner.lock().await.orders.get(&id).cloned())
    }

    async fn claim_next_order(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderJob>> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .orders
            .values()
            .filter(|job| {
                job.state == OrderState::Pending
                    && job.next_attempt_at.map_or(true, |at| at <= now)
            })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = inner.orders.get_mut(&id).ok_or_else(|| {
            PipelineError::Internal(format!("claim candidate {} vanished", id))
        })?;
        job.state = OrderState::Processing;
        job.claimed_by = Some(worker_id.to_string());
        job.processed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update_order(&self, job: &OrderJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.orders.contains_key(&job.id) {
            return Err(PipelineError::NotFound(format!("order {}", job.id)));
        }
        inner.orders.insert(job.id, job.clone());
        Ok(())
    }

    async fn try_cancel_order(&self, id: i64) -> Result<OrderJob> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("order {}", id)))?;
        if job.state != OrderState::Pending {
            return Err(PipelineError::InvalidState {
                operation: "cancel".into(),
                state: job.state.to_string(),
            });
        }
        job.state = OrderState::Cancelled;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn count_orders_by_state(&self, state: OrderState) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.orders.values().filter(|j| j.state == state).count() as i64)
    }

    async fn find_stuck_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<OrderJob>> {
        let inner = self.inner.lock().await;
        let mut stuck: Vec<OrderJob> = inner
            .orders
            .values()
            .filter(|j| j.state.is_reclaimable() && j.updated_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.updated_at);
        Ok(stuck)
    }

    async fn insert_trade_once(&self, trade: &Trade) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.trade_uids.insert(trade.trade_uid.clone()) {
            return Ok(false);
        }
        inner.next_trade_id += 1;
        let mut trade = trade.clone();
        trade.id = inner.next_trade_id;
        inner.trades.push(trade);
        Ok(true)
    }

    async fn get_position(&self, key: &PositionKey) -> Result<Option<Position>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .positions
            .values()
            .find(|p| &p.key() == key)
            .cloned())
    }

    async fn get_position_by_id(&self, id: i64) -> Result<Option<Position>> {
        Ok(self.inner.lock().await.positions.get(&id).cloned())
    }

    async fn upsert_position(&self, position: &Position) -> Result<Position> {
        let mut inner = self.inner.lock().await;
        let mut position = position.clone();
        let key = position.key();
        let existing_id = inner
            .positions
            .values()
            .find(|p| p.key() == key)
            .map(|p| p.id);
        match existing_id {
            Some(id) => position.id = id,
            None => {
                inner.next_position_id += 1;
                position.id = inner.next_position_id;
            }
        }
        inner.positions.insert(position.id, position.clone());
        Ok(position)
    }

    async fn delete_position(&self, key: &PositionKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.positions.retain(|_, p| &p.key() != key);
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let inner = self.inner.lock().await;
        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.id);
        Ok(positions)
    }

    async fn list_positions_by_symbol(&self, symbol: &str) -> Result<Vec<Position>> {
        let inner = self.inner.lock().await;
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.id);
        Ok(positions)
    }

    async fn insert_alert(&self, rule: &AlertRule) -> Result<AlertRule> {
        let mut inner = self.inner.lock().await;
        inner.next_alert_id += 1;
        let mut rule = rule.clone();
        rule.id = inner.next_alert_id;
        inner.alerts.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_alert(&self, rule: &AlertRule) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.alerts.contains_key(&rule.id) {
            return Err(PipelineError::NotFound(format!("alert {}", rule.id)));
        }
        inner.alerts.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn delete_alert(&self, id: i64) -> Result<()> {
        self.inner.lock().await.alerts.remove(&id);
        Ok(())
    }

    async fn get_alert(&self, id: i64) -> Result<Option<AlertRule>> {
        Ok(self.inner.lock().await.alerts.get(&id).cloned())
    }

    async fn list_alerts(&self) -> Result<Vec<AlertRule>> {
        let inner = self.inner.lock().await;
        let mut alerts: Vec<AlertRule> = inner.alerts.values().cloned().collect();
        alerts.sort_by_key(|a| a.id);
        Ok(alerts)
    }

    async fn list_active_alerts(&self) -> Result<Vec<AlertRule>> {
        let inner = self.inner.lock().await;
        let mut alerts: Vec<AlertRule> = inner
            .alerts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        alerts.sort_by_key(|a| a.id);
        Ok(alerts)
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<Monitor> {
        let mut inner = self.inner.lock().await;
        inner.next_monitor_id += 1;
        let mut monitor = monitor.clone();
        monitor.id = inner.next_monitor_id;
        inner.monitors.insert(monitor.id, monitor.clone());
        Ok(monitor)
    }

    async fn update_monitor(&self, monitor: &Monitor) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.monitors.contains_key(&monitor.id) {
            return Err(PipelineError::NotFound(format!("monitor {}", monitor.id)));
        }
        inner.monitors.insert(monitor.id, monitor.clone());
        Ok(())
    }

    async fn delete_monitor(&self, id: i64) -> Result<()> {
        self.inner.lock().await.monitors.remove(&id);
        Ok(())
    }

    async fn get_monitor(&self, id: i64) -> Result<Option<Monitor>> {
        Ok(self.inner.lock().await.monitors.get(&id).cloned())
    }

    async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        let inner = self.inner.lock().await;
        let mut monitors: Vec<Monitor> = inner.monitors.values().cloned().collect();
        monitors.sort_by_key(|m| m.id);
        Ok(monitors)
    }

    async fn due_monitors(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Monitor>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Monitor> = inner
            .monitors
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn insert_notification(&self, payload: &NotificationPayload) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.next_notification_id += 1;
        let id = inner.next_notification_id;
        inner.notifications.push(BrowserNotification {
            id,
            symbol: payload.symbol.clone(),
            kind: payload.kind.clone(),
            title: payload.title.clone(),
            message: payload.message.clone(),
            payload: payload.payload.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_notifications(&self, limit: i64) -> Result<Vec<BrowserNotification>> {
        let inner = self.inner.lock().await;
        let mut notifications: Vec<BrowserNotification> =
            inner.notifications.iter().rev().cloned().collect();
        notifications.truncate(limit.max(0) as usize);
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ExecutionMode, MarketType, OrderKind, OrderRequest, PositionSide, SignalType, TradeAction,
    };
    use rust_decimal_macros::dec;

    fn request(priority: i32) -> OrderRequest {
        OrderRequest {
            strategy_id: Some(1),
            account_id: 1,
            symbol: "BTC/USDT".to_string(),
            market: MarketType::Swap,
            signal: SignalType::OpenLong,
            kind: OrderKind::Market,
            amount: dec!(1),
            price: None,
            mode: ExecutionMode::Auto,
            priority,
            signal_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_claim_prefers_priority_then_age() {
        let store = MemoryStore::new();
        let low = store
            .insert_order(&OrderJob::from_request(request(0), 3))
            .await
            .unwrap();
        let high = store
            .insert_order(&OrderJob::from_request(request(5), 3))
            .await
            .unwrap();

        let first = store.claim_next_order("w1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.state, OrderState::Processing);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        let second = store.claim_next_order("w2", Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);

        assert!(store.claim_next_order("w3", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_backoff() {
        let store = MemoryStore::new();
        let mut job = OrderJob::from_request(request(0), 3);
        job.next_attempt_at = Some(Utc::now() + chrono::Duration::seconds(60));
        store.insert_order(&job).await.unwrap();

        assert!(store.claim_next_order("w1", Utc::now()).await.unwrap().is_none());
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert!(store.claim_next_order("w1", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let store = MemoryStore::new();
        let job = store
            .insert_order(&OrderJob::from_request(request(0), 3))
            .await
            .unwrap();

        store.claim_next_order("w1", Utc::now()).await.unwrap().unwrap();
        let err = store.try_cancel_order(job.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_trade_uid_dedupe() {
        let store = MemoryStore::new();
        let trade = Trade::new(
            None,
            None,
            1,
            "BTC/USDT",
            PositionSide::Long,
            TradeAction::Open,
            dec!(50000),
            dec!(1),
            dec!(0),
            Utc::now(),
        );
        assert!(store.insert_trade_once(&trade).await.unwrap());
        assert!(!store.insert_trade_once(&trade).await.unwrap());
        assert_eq!(store.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_position_upsert_keeps_key_unique() {
        let store = MemoryStore::new();
        let key = PositionKey {
            strategy_id: Some(1),
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
        };
        let first = store
            .upsert_position(&Position::open(&key, dec!(100), dec!(1), Utc::now()))
            .await
            .unwrap();
        let second = store
            .upsert_position(&Position::open(&key, dec!(200), dec!(2), Utc::now()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_positions().await.unwrap().len(), 1);
    }
}
