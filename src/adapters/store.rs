use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AlertRule, BrowserNotification, Monitor, NotificationPayload, OrderJob, OrderState, Position,
    PositionKey, Trade,
};
use crate::error::Result;

/// Persistent storage boundary. The store is the single source of truth;
/// services read fresh rows before mutating and never cache.
///
/// `claim_next_order` and `try_cancel_order` are the atomic compare-and-set
/// points of the queue; everything else is plain row IO.
#[async_trait]
pub trait Store: Send + Sync {
    // --- order jobs ---

    /// Persist a new job, returning it with its assigned id
    async fn insert_order(&self, job: &OrderJob) -> Result<OrderJob>;

    async fn get_order(&self, id: i64) -> Result<Option<OrderJob>>;

    /// Atomically claim the best eligible pending job for `worker_id`:
    /// highest priority first, oldest first within a priority, skipping rows
    /// whose `next_attempt_at` lies in the future. Returns the claimed row
    /// already moved to `processing`.
    async fn claim_next_order(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderJob>>;

    /// Write back the full row. The caller owns the claim; there is no
    /// concurrent writer for a claimed job.
    async fn update_order(&self, job: &OrderJob) -> Result<()>;

    /// Cancel iff still pending; `InvalidState` otherwise
    async fn try_cancel_order(&self, id: i64) -> Result<OrderJob>;

    async fn count_orders_by_state(&self, state: OrderState) -> Result<i64>;

    /// Processing/sent rows untouched since `cutoff` (watchdog input)
    async fn find_stuck_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<OrderJob>>;

    // --- trades ---

    /// Append the trade unless its `trade_uid` was already recorded.
    /// Returns false on the duplicate (the exactly-once gate).
    async fn insert_trade_once(&self, trade: &Trade) -> Result<bool>;

    // --- positions ---

    async fn get_position(&self, key: &PositionKey) -> Result<Option<Position>>;

    async fn get_position_by_id(&self, id: i64) -> Result<Option<Position>>;

    /// Insert or replace the row for the position's key, returning it with
    /// its assigned id
    async fn upsert_position(&self, position: &Position) -> Result<Position>;

    async fn delete_position(&self, key: &PositionKey) -> Result<()>;

    async fn list_positions(&self) -> Result<Vec<Position>>;

    async fn list_positions_by_symbol(&self, symbol: &str) -> Result<Vec<Position>>;

    // --- alert rules ---

    async fn insert_alert(&self, rule: &AlertRule) -> Result<AlertRule>;

    async fn update_alert(&self, rule: &AlertRule) -> Result<()>;

    async fn delete_alert(&self, id: i64) -> Result<()>;

    async fn get_alert(&self, id: i64) -> Result<Option<AlertRule>>;

    async fn list_alerts(&self) -> Result<Vec<AlertRule>>;

    async fn list_active_alerts(&self) -> Result<Vec<AlertRule>>;

    // --- monitors ---

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<Monitor>;

    async fn update_monitor(&self, monitor: &Monitor) -> Result<()>;

    async fn delete_monitor(&self, id: i64) -> Result<()>;

    async fn get_monitor(&self, id: i64) -> Result<Option<Monitor>>;

    async fn list_monitors(&self) -> Result<Vec<Monitor>>;

    /// Active monitors due at `now`, oldest `next_run_at` first, bounded
    async fn due_monitors(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Monitor>>;

    // --- browser notifications ---

    async fn insert_notification(&self, payload: &NotificationPayload) -> Result<()>;

    async fn list_notifications(&self, limit: i64) -> Result<Vec<BrowserNotification>>;
}
