use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::Store;
use crate::config::DispatchConfig;
use crate::domain::{OrderFill, OrderJob, OrderState};
use crate::error::{PipelineError, Result};
use crate::exchange::{ExchangeAdapter, ExecutionError, VenueOrder, VenueOrderStatus};
use crate::ledger::PositionLedger;

use super::dispatch::DispatchQueue;

/// Stuck-order reclaim and crash recovery. Scans processing/sent rows that
/// sat past the grace period and reconciles each against the venue; runs
/// once at startup before any worker claims, then periodically.
#[derive(Clone)]
pub struct QueueWatchdog {
    queue: Arc<DispatchQueue>,
    exchange: Arc<dyn ExchangeAdapter>,
    ledger: Arc<PositionLedger>,
    config: DispatchConfig,
    running: Arc<AtomicBool>,
}

impl QueueWatchdog {
    pub fn new(
        queue: Arc<DispatchQueue>,
        exchange: Arc<dyn ExchangeAdapter>,
        ledger: Arc<PositionLedger>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            exchange,
            ledger,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Queue watchdog already running");
            return;
        }

        info!(
            interval_secs = self.config.watchdog_interval_secs,
            grace_secs = self.config.stuck_grace_secs,
            "Starting queue watchdog"
        );

        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                watchdog.config.watchdog_interval_secs,
            ));
            while watchdog.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = watchdog.run_reconcile_pass().await {
                    error!(error = %e, "watchdog pass failed");
                }
            }
            info!("Queue watchdog stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Queue watchdog stop requested");
    }

    /// Post-crash pass: every in-flight row is suspect, regardless of age
    pub async fn run_startup_pass(&self) -> Result<usize> {
        self.reconcile_older_than(Duration::zero()).await
    }

    /// Periodic pass over rows stuck past the grace period
    pub async fn run_reconcile_pass(&self) -> Result<usize> {
        self.reconcile_older_than(Duration::seconds(self.config.stuck_grace_secs))
            .await
    }

    async fn reconcile_older_than(&self, grace: Duration) -> Result<usize> {
        let cutoff = Utc::now() - grace;
        let stuck = self.queue.store().find_stuck_orders(cutoff).await?;
        if stuck.is_empty() {
            return Ok(0);
        }

        info!(count = stuck.len(), "reconciling in-flight orders");
        let mut reconciled = 0;
        for job in stuck {
            match self.reconcile_order(job).await {
                Ok(()) => reconciled += 1,
                Err(e) => error!(error = %e, "order reconciliation failed"),
            }
        }
        Ok(reconciled)
    }

    async fn reconcile_order(&self, job: OrderJob) -> Result<()> {
        let lookup = match &job.exchange_order_id {
            Some(id) => self.exchange.lookup_order(&job.symbol, id).await,
            None => {
                self.exchange
                    .find_by_client_order_id(&job.symbol, &job.client_order_id)
                    .await
            }
        };

        match lookup {
            Ok(Some(venue)) => self.apply_venue_state(job, venue).await,
            Ok(None) => {
                if job.exchange_order_id.is_some() {
                    // We recorded a venue id the venue no longer knows
                    self.park(job, "venue lost order").await
                } else {
                    // Never reached the venue: release, bounded by attempts
                    debug!(order_id = job.id, "releasing unplaced order");
                    self.queue
                        .record_failure(
                            job,
                            &ExecutionError::Retryable("reclaimed by watchdog".into()),
                        )
                        .await?;
                    Ok(())
                }
            }
            Err(ExecutionError::Retryable(e)) => {
                // Venue unreachable; leave the row for the next pass
                debug!(order_id = job.id, error = %e, "reconciliation deferred");
                Ok(())
            }
            Err(ExecutionError::Terminal(e)) => self.park(job, &e).await,
        }
    }

    async fn apply_venue_state(&self, mut job: OrderJob, venue: VenueOrder) -> Result<()> {
        match venue.status {
            VenueOrderStatus::Filled | VenueOrderStatus::PartiallyFilled => {
                let Some(avg_price) = venue.avg_price else {
                    return self.park(job, "fill reported without price").await;
                };
                let fill = OrderFill {
                    exchange_order_id: venue.exchange_order_id,
                    filled_amount: venue.filled_amount,
                    avg_price,
                    commission: rust_decimal::Decimal::ZERO,
                    raw: None,
                    executed_at: Utc::now(),
                };
                info!(order_id = job.id, "applying late fill");
                // Deduped by trade uid if the worker already applied it;
                // ledger before order state, same as the worker path
                self.ledger.apply_order_fill(&job, &fill).await?;
                self.queue.record_fill(job, &fill).await?;
                Ok(())
            }
            VenueOrderStatus::Cancelled | VenueOrderStatus::Rejected => {
                self.queue
                    .record_failure(
                        job,
                        &ExecutionError::Terminal(format!(
                            "venue reports {:?}",
                            venue.status
                        )),
                    )
                    .await?;
                Ok(())
            }
            VenueOrderStatus::Open => {
                // Placed and resting: make sure we track it as sent and
                // restart the grace clock
                let now = Utc::now();
                if job.state == OrderState::Processing {
                    job.state = OrderState::Sent;
                    job.sent_at = Some(now);
                }
                job.exchange_order_id = Some(venue.exchange_order_id);
                job.updated_at = now;
                self.queue.store().update_order(&job).await?;
                Ok(())
            }
        }
    }

    async fn park(&self, mut job: OrderJob, reason: &str) -> Result<()> {
        let err = PipelineError::Reconciliation(reason.to_string());
        warn!(order_id = job.id, error = %err, "parking order for review");
        job.state = OrderState::NeedsReview;
        job.last_error = Some(err.to_string());
        job.updated_at = Utc::now();
        self.queue.store().update_order(&job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryStore, Store};
    use crate::domain::{
        ExecutionMode, MarketType, OrderKind, OrderRequest, SignalType,
    };
    use crate::exchange::PaperExchange;
    use rust_decimal_macros::dec;

    fn request() -> OrderRequest {
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
            priority: 0,
            signal_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<PaperExchange>, Arc<DispatchQueue>, QueueWatchdog) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let exchange = Arc::new(PaperExchange::new());
        let queue = Arc::new(DispatchQueue::new(
            store.clone(),
            crate::config::DispatchConfig::default(),
        ));
        let ledger = Arc::new(PositionLedger::new(store.clone()));
        let watchdog = QueueWatchdog::new(
            queue.clone(),
            exchange.clone(),
            ledger,
            crate::config::DispatchConfig::default(),
        );
        (store, exchange, queue, watchdog)
    }

    #[tokio::test]
    async fn test_unplaced_order_released_to_pending() {
        let (store, _exchange, queue, watchdog) = setup();
        queue.enqueue(request()).await.unwrap();
        let job = queue.claim_next("w1").await.unwrap().unwrap();

        // Startup pass sees a claimed order the venue never heard of
        let reconciled = watchdog.run_startup_pass().await.unwrap();
        assert_eq!(reconciled, 1);

        let job = store.get_order(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, OrderState::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_late_fill_applied_exactly_once() {
        let (store, exchange, queue, watchdog) = setup();
        exchange.set_price("BTC/USDT", dec!(50000));
        queue.enqueue(request()).await.unwrap();
        let job = queue.claim_next("w1").await.unwrap().unwrap();

        // The adapter call succeeded at the venue, but the worker died
        // before recording anything
        let fill = exchange.execute(&job).await.unwrap();

        let reconciled = watchdog.run_startup_pass().await.unwrap();
        assert_eq!(reconciled, 1);

        let job = store.get_order(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, OrderState::Filled);
        assert_eq!(job.exchange_order_id, Some(fill.exchange_order_id));

        let positions = store.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(1));

        // A second pass finds nothing in flight
        assert_eq!(watchdog.run_startup_pass().await.unwrap(), 0);
        assert_eq!(store.list_positions().await.unwrap()[0].size, dec!(1));
    }

    #[tokio::test]
    async fn test_crash_after_trade_applied_not_double_counted() {
        let (store, exchange, queue, watchdog) = setup();
        exchange.set_price("BTC/USDT", dec!(50000));
        queue.enqueue(request()).await.unwrap();
        let job = queue.claim_next("w1").await.unwrap().unwrap();

        // Worker applied the trade but died before the order left
        // processing
        let fill = exchange.execute(&job).await.unwrap();
        let ledger = PositionLedger::new(store.clone());
        ledger.apply_order_fill(&job, &fill).await.unwrap();

        assert_eq!(watchdog.run_startup_pass().await.unwrap(), 1);

        let job = store.get_order(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, OrderState::Filled);
        let positions = store.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(1));
        assert_eq!(store.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_sent_order_parked_for_review() {
        let (store, _exchange, queue, watchdog) = setup();
        queue.enqueue(request()).await.unwrap();
        let mut job = queue.claim_next("w1").await.unwrap().unwrap();

        // Recorded as sent with a venue id the paper venue does not know
        job.state = OrderState::Sent;
        job.exchange_order_id = Some("ghost-1".to_string());
        store.update_order(&job).await.unwrap();

        watchdog.run_startup_pass().await.unwrap();

        let job = store.get_order(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, OrderState::NeedsReview);
        assert!(job.last_error.unwrap().starts_with("Reconciliation failed"));
    }

    #[tokio::test]
    async fn test_recent_orders_left_alone_by_periodic_pass() {
        let (store, _exchange, queue, watchdog) = setup();
        queue.enqueue(request()).await.unwrap();
        let job = queue.claim_next("w1").await.unwrap().unwrap();

        // Still within the grace period
        assert_eq!(watchdog.run_reconcile_pass().await.unwrap(), 0);
        let job = store.get_order(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, OrderState::Processing);
    }
}
