use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;
use uuid::Uuid;

use async_trait::async_trait;

use crate::domain::{OrderFill, OrderJob, OrderKind};

use super::traits::{ExchangeAdapter, ExecutionError, VenueOrder, VenueOrderStatus};

/// In-memory venue for dry-run mode and tests. Fills market orders at the
/// configured mark price immediately; limit orders fill at their limit price.
pub struct PaperExchange {
    marks: DashMap<String, Decimal>,
    /// Placed orders by client order id, so reconciliation paths work
    orders: DashMap<String, VenueOrder>,
    commission_rate: Decimal,
    fail_remaining: AtomicU32,
    fail_terminal: AtomicU32,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            marks: DashMap::new(),
            orders: DashMap::new(),
            commission_rate: Decimal::ZERO,
            fail_remaining: AtomicU32::new(0),
            fail_terminal: AtomicU32::new(0),
        }
    }

    pub fn with_commission_rate(mut self, rate: Decimal) -> Self {
        self.commission_rate = rate;
        self
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.marks.insert(symbol.to_string(), price);
    }

    /// Make the next `n` executions fail with a retryable error
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` executions fail with a terminal error
    pub fn fail_next_terminal(&self, n: u32) {
        self.fail_terminal.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Option<ExecutionError> {
        if self
            .fail_terminal
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Some(ExecutionError::Terminal("paper: order rejected".into()));
        }
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Some(ExecutionError::Retryable("paper: venue unavailable".into()));
        }
        None
    }

    fn fill_price(&self, job: &OrderJob) -> Result<Decimal, ExecutionError> {
        match job.kind {
            OrderKind::Limit => job
                .price
                .ok_or_else(|| ExecutionError::Terminal("limit order without price".into())),
            OrderKind::Market => self
                .marks
                .get(&job.symbol)
                .map(|p| *p)
                .or(job.price)
                .ok_or_else(|| {
                    ExecutionError::Retryable(format!("no mark price for {}", job.symbol))
                }),
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn execute(&self, job: &OrderJob) -> Result<OrderFill, ExecutionError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }

        let price = self.fill_price(job)?;
        let exchange_order_id = format!("paper-{}", Uuid::new_v4());

        let venue_order = VenueOrder {
            exchange_order_id: exchange_order_id.clone(),
            status: VenueOrderStatus::Filled,
            filled_amount: job.amount,
            avg_price: Some(price),
        };
        self.orders
            .insert(job.client_order_id.clone(), venue_order);

        debug!(
            order_id = job.id,
            symbol = %job.symbol,
            %price,
            amount = %job.amount,
            "paper fill"
        );

        Ok(OrderFill {
            exchange_order_id,
            filled_amount: job.amount,
            avg_price: price,
            commission: price * job.amount * self.commission_rate,
            raw: None,
            executed_at: Utc::now(),
        })
    }

    async fn lookup_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<Option<VenueOrder>, ExecutionError> {
        Ok(self
            .orders
            .iter()
            .find(|entry| entry.value().exchange_order_id == exchange_order_id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_client_order_id(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<VenueOrder>, ExecutionError> {
        Ok(self.orders.get(client_order_id).map(|o| o.clone()))
    }
}
