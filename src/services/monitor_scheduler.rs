use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::{Notifier, Store};
use crate::config::MonitorsConfig;
use crate::domain::{Monitor, NotificationPayload, PortfolioSummary, Position};
use crate::error::{PipelineError, Result};
use crate::ledger::PositionLedger;

/// Cron-like portfolio monitors. Each tick picks up due monitors (oldest
/// first, bounded batch) and runs the portfolio report over their scope.
/// A monitor still running is skipped, never queued.
#[derive(Clone)]
pub struct MonitorScheduler {
    store: Arc<dyn Store>,
    ledger: Arc<PositionLedger>,
    notifier: Arc<Notifier>,
    config: MonitorsConfig,
    running: Arc<AtomicBool>,
    in_flight: Arc<DashMap<i64, ()>>,
}

impl MonitorScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<PositionLedger>,
        notifier: Arc<Notifier>,
        config: MonitorsConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            config,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Monitor scheduler already running");
            return;
        }

        info!(
            interval_secs = self.config.tick_interval_secs,
            "Starting monitor scheduler"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                scheduler.config.tick_interval_secs,
            ));
            while scheduler.running.load(Ordering::SeqCst) {
                interval.tick().await;
                match scheduler.run_tick().await {
                    Ok(ran) if ran > 0 => debug!(ran, "monitor tick complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "monitor tick failed"),
                }
            }
            info!("Monitor scheduler stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Monitor scheduler stop requested");
    }

    /// Run all due monitors once, returning how many actually ran
    pub async fn run_tick(&self) -> Result<usize> {
        let due = self
            .store
            .due_monitors(Utc::now(), self.config.max_per_tick)
            .await?;
        let mut ran = 0;
        for monitor in due {
            match self.run_one(monitor, true).await {
                Ok(Some(_)) => ran += 1,
                Ok(None) => {}
                Err(e) => error!(error = %e, "monitor run failed"),
            }
        }
        Ok(ran)
    }

    /// Execute a monitor immediately. Leaves `next_run_at` alone: the
    /// regular schedule is unaffected by manual runs.
    pub async fn run_now(&self, id: i64) -> Result<serde_json::Value> {
        let monitor = self
            .store
            .get_monitor(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("monitor {}", id)))?;
        match self.run_one(monitor, false).await? {
            Some(report) => Ok(report),
            None => Err(PipelineError::InvalidState {
                operation: "run_now".into(),
                state: "running".into(),
            }),
        }
    }

    /// Single-flight execution; returns None when the monitor is already
    /// running somewhere else
    async fn run_one(
        &self,
        mut monitor: Monitor,
        scheduled: bool,
    ) -> Result<Option<serde_json::Value>> {
        if self.in_flight.insert(monitor.id, ()).is_some() {
            debug!(monitor_id = monitor.id, "monitor already in flight, skipping");
            return Ok(None);
        }

        let result = self.execute(&mut monitor, scheduled).await;
        self.in_flight.remove(&monitor.id);
        result.map(Some)
    }

    async fn execute(
        &self,
        monitor: &mut Monitor,
        scheduled: bool,
    ) -> Result<serde_json::Value> {
        let now = Utc::now();
        let positions = self.scoped_positions(monitor).await?;
        let report = Self::build_report(monitor, &positions);

        monitor.last_run_at = Some(now);
        monitor.last_result = Some(report.clone());
        monitor.run_count += 1;
        if scheduled {
            monitor.next_run_at = monitor.next_run_after(now);
        }
        monitor.updated_at = now;
        self.store.update_monitor(monitor).await?;

        info!(
            monitor_id = monitor.id,
            name = %monitor.name,
            positions = positions.len(),
            scheduled,
            "monitor ran"
        );

        let summary = PortfolioSummary::from_positions(&positions);
        let payload = NotificationPayload {
            symbol: String::new(),
            kind: "monitor".to_string(),
            title: format!("Monitor: {}", monitor.name),
            message: format!(
                "{} position(s), cost {}, value {}, unrealized {} ({}%)",
                summary.position_count,
                summary.total_cost,
                summary.total_value,
                summary.total_unrealized_pnl,
                summary.pnl_percent.round_dp(2)
            ),
            payload: Some(report.clone()),
        };
        self.notifier.dispatch(&monitor.notification, &payload).await;

        Ok(report)
    }

    async fn scoped_positions(&self, monitor: &Monitor) -> Result<Vec<Position>> {
        if monitor.position_ids.is_empty() {
            return self.ledger.list().await;
        }
        let mut positions = Vec::with_capacity(monitor.position_ids.len());
        for id in &monitor.position_ids {
            if let Some(position) = self.store.get_position_by_id(*id).await? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    fn build_report(monitor: &Monitor, positions: &[Position]) -> serde_json::Value {
        let summary = PortfolioSummary::from_positions(positions);
        json!({
            "monitor_id": monitor.id,
            "generated_at": Utc::now(),
            "position_count": summary.position_count,
            "total_cost": summary.total_cost,
            "total_value": summary.total_value,
            "total_unrealized_pnl": summary.total_unrealized_pnl,
            "pnl_percent": summary.pnl_percent,
            "positions": positions
                .iter()
                .map(|p| {
                    json!({
                        "symbol": p.symbol,
                        "side": p.side,
                        "size": p.size,
                        "entry_price": p.entry_price,
                        "current_price": p.current_price,
                        "unrealized_pnl": p.unrealized_pnl,
                        "pnl_percent": p.pnl_percent,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }

    // --- monitor management ---

    pub async fn create_monitor(&self, monitor: Monitor) -> Result<Monitor> {
        monitor.validate()?;
        self.store.insert_monitor(&monitor).await
    }

    /// Update the user-editable parameters of a monitor. Scheduler-owned
    /// bookkeeping (`next_run_at`, `run_count`, `last_run_at`,
    /// `last_result`) is never taken from the caller.
    pub async fn update_monitor(&self, update: Monitor) -> Result<Monitor> {
        update.validate()?;
        let mut monitor = self
            .store
            .get_monitor(update.id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("monitor {}", update.id)))?;
        monitor.name = update.name;
        monitor.position_ids = update.position_ids;
        monitor.interval_min = update.interval_min;
        monitor.is_active = update.is_active;
        monitor.notification = update.notification;
        monitor.updated_at = Utc::now();
        self.store.update_monitor(&monitor).await?;
        Ok(monitor)
    }

    pub async fn delete_monitor(&self, id: i64) -> Result<()> {
        self.store.delete_monitor(id).await
    }

    pub async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        self.store.list_monitors().await
    }
}
