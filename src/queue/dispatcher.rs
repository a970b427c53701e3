use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapters::Notifier;
use crate::config::DispatchConfig;
use crate::domain::{
    ExecutionMode, NotificationConfig, NotificationPayload, OrderJob, OrderState,
};
use crate::error::Result;
use crate::exchange::ExchangeAdapter;
use crate::ledger::PositionLedger;

use super::dispatch::DispatchQueue;

/// Fixed-size worker pool draining the dispatch queue. Workers share
/// nothing but the store; a panicking or erroring claim never affects the
/// others.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
    exchange: Arc<dyn ExchangeAdapter>,
    ledger: Arc<PositionLedger>,
    notifier: Arc<Notifier>,
    ops_channel: Option<NotificationConfig>,
    config: DispatchConfig,
    running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<DispatchQueue>,
        exchange: Arc<dyn ExchangeAdapter>,
        ledger: Arc<PositionLedger>,
        notifier: Arc<Notifier>,
        ops_channel: Option<NotificationConfig>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            exchange,
            ledger,
            notifier,
            ops_channel,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the worker pool
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatcher already running");
            return;
        }

        info!(workers = self.config.workers, "Starting dispatcher");

        for i in 0..self.config.workers {
            let dispatcher = self.clone();
            let worker_id = format!("worker-{}", i);
            tokio::spawn(async move {
                let idle =
                    tokio::time::Duration::from_millis(dispatcher.config.poll_interval_ms);
                while dispatcher.running.load(Ordering::SeqCst) {
                    match dispatcher.process_one(&worker_id).await {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(idle).await,
                        Err(e) => {
                            error!(worker = %worker_id, error = %e, "dispatch cycle failed");
                            tokio::time::sleep(idle).await;
                        }
                    }
                }
                info!(worker = %worker_id, "dispatcher worker stopped");
            });
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Dispatcher stop requested");
    }

    /// Claim and fully process one job. Returns false when the queue had
    /// nothing eligible.
    pub async fn process_one(&self, worker_id: &str) -> Result<bool> {
        let Some(job) = self.queue.claim_next(worker_id).await? else {
            return Ok(false);
        };

        match job.mode {
            ExecutionMode::NotifyOnly => self.handle_notify_only(job).await?,
            ExecutionMode::Auto => self.handle_auto(job).await?,
        }
        Ok(true)
    }

    async fn handle_auto(&self, job: OrderJob) -> Result<()> {
        match self.exchange.execute(&job).await {
            Ok(fill) => {
                // Ledger first: a crash here leaves the order in processing
                // for the watchdog, which re-applies the fill deduped by
                // trade uid. Terminal order state always implies the trade
                // is recorded.
                self.ledger.apply_order_fill(&job, &fill).await?;
                self.queue.record_fill(job, &fill).await?;
            }
            Err(e) => {
                let job = self.queue.record_failure(job, &e).await?;
                if job.state == OrderState::Failed {
                    self.notify_terminal_failure(&job).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_notify_only(&self, job: OrderJob) -> Result<()> {
        let payload = NotificationPayload {
            symbol: job.symbol.clone(),
            kind: "signal".to_string(),
            title: format!("Signal: {} {}", job.signal, job.symbol),
            message: format!(
                "{} {} amount {}{}",
                job.signal,
                job.symbol,
                job.amount,
                job.price
                    .map(|p| format!(" @ {}", p))
                    .unwrap_or_default()
            ),
            payload: Some(json!({
                "order_id": job.id,
                "signal": job.signal,
                "market": job.market,
                "amount": job.amount,
                "price": job.price,
            })),
        };

        let config = self
            .ops_channel
            .clone()
            .unwrap_or_else(NotificationConfig::browser_only);
        self.notifier.dispatch(&config, &payload).await;
        self.queue.record_notified(job).await?;
        Ok(())
    }

    async fn notify_terminal_failure(&self, job: &OrderJob) {
        let Some(config) = &self.ops_channel else {
            return;
        };
        let payload = NotificationPayload {
            symbol: job.symbol.clone(),
            kind: "order_failed".to_string(),
            title: format!("Order {} failed", job.id),
            message: format!(
                "{} {} failed after {} attempt(s): {}",
                job.signal,
                job.symbol,
                job.attempts,
                job.last_error.as_deref().unwrap_or("unknown error")
            ),
            payload: Some(json!({
                "order_id": job.id,
                "client_order_id": job.client_order_id,
                "attempts": job.attempts,
            })),
        };
        self.notifier.dispatch(config, &payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryStore, Store};
    use crate::config::NotifySettings;
    use crate::domain::{MarketType, OrderKind, OrderRequest, SignalType};
    use crate::exchange::PaperExchange;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn request(mode: ExecutionMode) -> OrderRequest {
        OrderRequest {
            strategy_id: Some(1),
            account_id: 1,
            symbol: "BTC/USDT".to_string(),
            market: MarketType::Swap,
            signal: SignalType::OpenLong,
            kind: OrderKind::Market,
            amount: dec!(1),
            price: None,
            mode,
            priority: 0,
            signal_at: Utc::now(),
        }
    }

    fn pipeline() -> (Arc<MemoryStore>, Arc<PaperExchange>, Dispatcher) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let exchange = Arc::new(PaperExchange::new());
        let queue = Arc::new(DispatchQueue::new(
            store.clone(),
            DispatchConfig::default(),
        ));
        let ledger = Arc::new(PositionLedger::new(store.clone()));
        let notifier =
            Arc::new(Notifier::new(&NotifySettings::default(), store.clone()).unwrap());
        let dispatcher = Dispatcher::new(
            queue,
            exchange.clone(),
            ledger,
            notifier,
            None,
            DispatchConfig::default(),
        );
        (store, exchange, dispatcher)
    }

    #[tokio::test]
    async fn test_auto_order_fills_and_opens_position() {
        let (store, exchange, dispatcher) = pipeline();
        exchange.set_price("BTC/USDT", dec!(50000));
        let job = dispatcher
            .queue
            .enqueue(request(ExecutionMode::Auto))
            .await
            .unwrap();

        assert!(dispatcher.process_one("w1").await.unwrap());
        assert!(!dispatcher.process_one("w1").await.unwrap());

        let job = dispatcher.queue.status(job.id).await.unwrap();
        assert_eq!(job.state, OrderState::Filled);
        assert_eq!(job.avg_fill_price, Some(dec!(50000)));

        let positions = store.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(1));
        assert_eq!(positions[0].entry_price, dec!(50000));
    }

    #[tokio::test]
    async fn test_notify_only_never_hits_exchange() {
        let (store, _exchange, dispatcher) = pipeline();
        // no mark price set: an auto order would fail, notify-only must not
        let job = dispatcher
            .queue
            .enqueue(request(ExecutionMode::NotifyOnly))
            .await
            .unwrap();

        assert!(dispatcher.process_one("w1").await.unwrap());

        let job = dispatcher.queue.status(job.id).await.unwrap();
        assert_eq!(job.state, OrderState::Notified);
        assert!(store.list_positions().await.unwrap().is_empty());
        assert_eq!(store.list_notifications(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_notifies_ops_channel() {
        use crate::exchange::traits::MockExchangeAdapter;

        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let mut mock = MockExchangeAdapter::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Err(crate::exchange::ExecutionError::Terminal(
                "insufficient margin".into(),
            )));

        let queue = Arc::new(DispatchQueue::new(
            store.clone(),
            DispatchConfig::default(),
        ));
        let ledger = Arc::new(PositionLedger::new(store.clone()));
        let notifier =
            Arc::new(Notifier::new(&NotifySettings::default(), store.clone()).unwrap());
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(mock),
            ledger,
            notifier,
            Some(NotificationConfig::browser_only()),
            DispatchConfig::default(),
        );

        let job = queue.enqueue(request(ExecutionMode::Auto)).await.unwrap();
        assert!(dispatcher.process_one("w1").await.unwrap());

        let job = queue.status(job.id).await.unwrap();
        assert_eq!(job.state, OrderState::Failed);
        assert_eq!(job.attempts, 1);

        let notifications = store.list_notifications(10).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "order_failed");
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_to_failed() {
        let (_store, exchange, dispatcher) = pipeline();
        exchange.set_price("BTC/USDT", dec!(50000));
        exchange.fail_next(10);
        let job = dispatcher
            .queue
            .enqueue(request(ExecutionMode::Auto))
            .await
            .unwrap();

        // Each pass consumes one attempt; backoff defers the retry, so walk
        // the clock by clearing next_attempt_at between passes
        for _ in 0..3 {
            let mut current = dispatcher.queue.status(job.id).await.unwrap();
            if current.state == OrderState::Pending {
                current.next_attempt_at = None;
                dispatcher.queue.store().update_order(&current).await.unwrap();
            }
            dispatcher.process_one("w1").await.unwrap();
        }

        let job = dispatcher.queue.status(job.id).await.unwrap();
        assert_eq!(job.state, OrderState::Failed);
        assert_eq!(job.attempts, 3);
    }
}
