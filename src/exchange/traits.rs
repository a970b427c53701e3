use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{OrderFill, OrderJob};

/// Adapter-side failure classification. Retryable failures consume an
/// attempt and go back to the queue; terminal ones fail the order outright.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("terminal: {0}")]
    Terminal(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Retryable(_))
    }
}

impl From<ExecutionError> for crate::error::PipelineError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Retryable(msg) => crate::error::PipelineError::RetryableExecution(msg),
            ExecutionError::Terminal(msg) => crate::error::PipelineError::TerminalExecution(msg),
        }
    }
}

/// Venue-side view of an order, used by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueOrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub exchange_order_id: String,
    pub status: VenueOrderStatus,
    pub filled_amount: Decimal,
    pub avg_price: Option<Decimal>,
}

/// External venue collaborator. Implementations must be safe to call
/// concurrently from all dispatcher workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Place the order, passing `client_order_id` through to the venue so
    /// crash recovery can find it again.
    async fn execute(&self, job: &OrderJob) -> Result<OrderFill, ExecutionError>;

    /// Look up an order by the venue's own id
    async fn lookup_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<Option<VenueOrder>, ExecutionError>;

    /// Look up an order by our client order id (crash recovery path)
    async fn find_by_client_order_id(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<VenueOrder>, ExecutionError>;
}
