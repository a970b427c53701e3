use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::Store;
use crate::config::DispatchConfig;
use crate::domain::{OrderFill, OrderJob, OrderRequest, OrderState};
use crate::error::{PipelineError, Result};
use crate::exchange::ExecutionError;

/// Queue depth broken down by live states
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub needs_review: i64,
}

/// Order dispatch queue over the persistent store. Owns validation, the
/// retry/backoff policy, and staleness fencing; the store owns atomicity.
pub struct DispatchQueue {
    store: Arc<dyn Store>,
    config: DispatchConfig,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn Store>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate and persist a new pending job
    pub async fn enqueue(&self, request: OrderRequest) -> Result<OrderJob> {
        request.validate()?;
        let job = OrderJob::from_request(request, self.config.max_attempts);
        let job = self.store.insert_order(&job).await?;
        info!(
            order_id = job.id,
            client_order_id = %job.client_order_id,
            symbol = %job.symbol,
            signal = %job.signal,
            "order enqueued"
        );
        Ok(job)
    }

    /// Claim the next dispatchable job for `worker_id`. Stale signals are
    /// failed on the spot and never handed out; the loop moves on to the
    /// next candidate.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<OrderJob>> {
        loop {
            let now = Utc::now();
            let Some(mut job) = self.store.claim_next_order(worker_id, now).await? else {
                return Ok(None);
            };

            if job.is_stale(now, self.config.stale_signal_max_secs) {
                let err = PipelineError::StaleSignal {
                    age_secs: job.signal_age_secs(now),
                };
                warn!(order_id = job.id, error = %err, "signal expired before dispatch");
                job.state = OrderState::Failed;
                job.last_error = Some("stale_signal".to_string());
                job.updated_at = now;
                self.store.update_order(&job).await?;
                continue;
            }

            return Ok(Some(job));
        }
    }

    /// Record a completed execution: processing -> sent -> filled (or
    /// partially_filled when the venue returned less than requested)
    pub async fn record_fill(&self, mut job: OrderJob, fill: &OrderFill) -> Result<OrderJob> {
        // Processing walks through sent; sent and needs_review (late fill
        // reconciliation) go straight to the fill state
        if !matches!(
            job.state,
            OrderState::Processing | OrderState::Sent | OrderState::NeedsReview
        ) {
            return Err(PipelineError::InvalidState {
                operation: "record_fill".to_string(),
                state: job.state.to_string(),
            });
        }
        let final_state = if fill.filled_amount < job.amount {
            OrderState::PartiallyFilled
        } else {
            OrderState::Filled
        };

        let now = Utc::now();
        job.state = final_state;
        job.exchange_order_id = Some(fill.exchange_order_id.clone());
        job.raw_response = fill.raw.clone();
        job.filled_amount = Some(fill.filled_amount);
        job.avg_fill_price = Some(fill.avg_price);
        job.sent_at = Some(now);
        job.executed_at = Some(fill.executed_at);
        job.last_error = None;
        job.updated_at = now;
        self.store.update_order(&job).await?;

        info!(
            order_id = job.id,
            state = %job.state,
            filled = %fill.filled_amount,
            price = %fill.avg_price,
            "order executed"
        );
        Ok(job)
    }

    /// Record a notify-only order whose notification went out
    pub async fn record_notified(&self, mut job: OrderJob) -> Result<OrderJob> {
        self.check_transition(&job, OrderState::Notified, "record_notified")?;
        job.state = OrderState::Notified;
        job.executed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        self.store.update_order(&job).await?;
        info!(order_id = job.id, "notify-only order dispatched");
        Ok(job)
    }

    /// Record an execution failure. Retryable failures consume an attempt
    /// and return to pending behind exponential backoff; terminal failures
    /// or attempt exhaustion fail the order for good.
    pub async fn record_failure(
        &self,
        mut job: OrderJob,
        error: &ExecutionError,
    ) -> Result<OrderJob> {
        let now = Utc::now();
        let surfaced = PipelineError::from(error.clone());
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.last_error = Some(surfaced.to_string());
        job.claimed_by = None;
        job.updated_at = now;

        if error.is_retryable() && job.attempts < job.max_attempts {
            job.state = OrderState::Pending;
            job.next_attempt_at = Some(now + self.backoff_delay(job.attempts));
            warn!(
                order_id = job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                error = %surfaced,
                "execution failed, will retry"
            );
        } else {
            job.state = OrderState::Failed;
            job.next_attempt_at = None;
            warn!(
                order_id = job.id,
                attempts = job.attempts,
                error = %surfaced,
                "order failed permanently"
            );
        }

        self.store.update_order(&job).await?;
        Ok(job)
    }

    /// Cancel a pending job; anything past pending is `InvalidState`
    pub async fn cancel(&self, id: i64) -> Result<OrderJob> {
        let job = self.store.try_cancel_order(id).await?;
        info!(order_id = id, "order cancelled");
        Ok(job)
    }

    pub async fn status(&self, id: i64) -> Result<OrderJob> {
        self.store
            .get_order(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("order {}", id)))
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        Ok(QueueDepth {
            pending: self.store.count_orders_by_state(OrderState::Pending).await?,
            processing: self
                .store
                .count_orders_by_state(OrderState::Processing)
                .await?,
            sent: self.store.count_orders_by_state(OrderState::Sent).await?,
            needs_review: self
                .store
                .count_orders_by_state(OrderState::NeedsReview)
                .await?,
        })
    }

    fn check_transition(&self, job: &OrderJob, target: OrderState, operation: &str) -> Result<()> {
        if !job.state.can_transition_to(target) {
            return Err(PipelineError::InvalidState {
                operation: operation.to_string(),
                state: job.state.to_string(),
            });
        }
        Ok(())
    }

    /// Exponential backoff with jitter: base * 2^(attempts-1), capped, plus
    /// up to half the step again in jitter
    fn backoff_delay(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16) as u32;
        let step = self
            .config
            .retry_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.retry_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=step / 2);
        Duration::milliseconds((step + jitter).min(self.config.retry_cap_ms) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::{ExecutionMode, MarketType, OrderKind, SignalType};
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    fn queue() -> DispatchQueue {
        DispatchQueue::new(Arc::new(MemoryStore::new()), DispatchConfig::default())
    }

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

    #[tokio::test]
    async fn test_enqueue_rejects_invalid() {
        let queue = queue();
        let mut bad = request();
        bad.amount = dec!(-1);
        assert!(matches!(
            queue.enqueue(bad).await.unwrap_err(),
            PipelineError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_signal_failed_at_claim() {
        let queue = queue();
        let mut stale = request();
        stale.signal_at = Utc::now() - Duration::seconds(600);
        let job = assert_ok!(queue.enqueue(stale).await);

        assert!(queue.claim_next("w1").await.unwrap().is_none());
        let job = queue.status(job.id).await.unwrap();
        assert_eq!(job.state, OrderState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("stale_signal"));
    }

    #[tokio::test]
    async fn test_retry_until_exhaustion() {
        let queue = queue();
        queue.enqueue(request()).await.unwrap();
        let error = ExecutionError::Retryable("venue down".into());

        // max_attempts = 3: two retries, third failure is final
        let job = queue.claim_next("w1").await.unwrap().unwrap();
        let job = queue.record_failure(job, &error).await.unwrap();
        assert_eq!(job.state, OrderState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.next_attempt_at.is_some());

        let mut job = queue.status(job.id).await.unwrap();
        job.state = OrderState::Processing;
        let job = queue.record_failure(job, &error).await.unwrap();
        assert_eq!(job.state, OrderState::Pending);
        assert_eq!(job.attempts, 2);

        let mut job = queue.status(job.id).await.unwrap();
        job.state = OrderState::Processing;
        let job = queue.record_failure(job, &error).await.unwrap();
        assert_eq!(job.state, OrderState::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.attempts <= job.max_attempts);
        assert!(job
            .last_error
            .unwrap()
            .starts_with("Retryable execution failure"));
    }

    #[tokio::test]
    async fn test_terminal_error_fails_immediately() {
        let queue = queue();
        queue.enqueue(request()).await.unwrap();

        let job = queue.claim_next("w1").await.unwrap().unwrap();
        let job = queue
            .record_failure(job, &ExecutionError::Terminal("rejected".into()))
            .await
            .unwrap();
        assert_eq!(job.state, OrderState::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job
            .last_error
            .unwrap()
            .starts_with("Terminal execution failure"));
    }

    #[tokio::test]
    async fn test_partial_fill_state() {
        let queue = queue();
        queue.enqueue(request()).await.unwrap();
        let job = queue.claim_next("w1").await.unwrap().unwrap();

        let fill = OrderFill {
            exchange_order_id: "x-1".to_string(),
            filled_amount: dec!(0.4),
            avg_price: dec!(50000),
            commission: dec!(0),
            raw: None,
            executed_at: Utc::now(),
        };
        let job = queue.record_fill(job, &fill).await.unwrap();
        assert_eq!(job.state, OrderState::PartiallyFilled);
        assert_eq!(job.filled_amount, Some(dec!(0.4)));
    }

    #[tokio::test]
    async fn test_cancel_claimed_is_invalid_state() {
        let queue = queue();
        let job = queue.enqueue(request()).await.unwrap();
        queue.claim_next("w1").await.unwrap().unwrap();

        assert!(matches!(
            queue.cancel(job.id).await.unwrap_err(),
            PipelineError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let queue = queue();
        let d1 = queue.backoff_delay(1);
        let d4 = queue.backoff_delay(4);
        assert!(d1.num_milliseconds() >= 1000);
        assert!(d4.num_milliseconds() >= 8000);
        let capped = queue.backoff_delay(12);
        assert!(capped.num_milliseconds() <= 60_000);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let queue = Arc::new(queue());
        queue.enqueue(request()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.claim_next(&format!("w{}", i)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
