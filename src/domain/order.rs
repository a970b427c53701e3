use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Order job lifecycle states.
///
/// Machine: pending -> processing -> {sent -> {filled | partially_filled |
/// failed} | failed | notified} | cancelled. `needs_review` holds orders the
/// watchdog could not reconcile against the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Queued, eligible for claiming
    Pending,
    /// Claimed by a worker, adapter call in flight
    Processing,
    /// Accepted by the venue, fill outcome unknown
    Sent,
    /// Fully executed
    Filled,
    /// Executed for less than the requested amount
    PartiallyFilled,
    /// Terminally failed, `last_error` populated
    Failed,
    /// Cancelled before dispatch
    Cancelled,
    /// Notify-only order whose notification was dispatched
    Notified,
    /// Reconciliation could not confirm venue state; manual resolution
    NeedsReview,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Processing => "processing",
            OrderState::Sent => "sent",
            OrderState::Filled => "filled",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Failed => "failed",
            OrderState::Cancelled => "cancelled",
            OrderState::Notified => "notified",
            OrderState::NeedsReview => "needs_review",
        }
    }

    /// Whether a transition to `next` is legal
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Processing, Sent)
            | (Processing, Failed)
            | (Processing, Notified)
            | (Processing, Pending)
            | (Processing, NeedsReview) => true,
            (Sent, Filled) | (Sent, PartiallyFilled) | (Sent, Failed) | (Sent, NeedsReview) => true,
            // Late fill reconciliation may still resolve a parked order
            (NeedsReview, Filled) | (NeedsReview, PartiallyFilled) | (NeedsReview, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::PartiallyFilled
                | OrderState::Failed
                | OrderState::Cancelled
                | OrderState::Notified
        )
    }

    /// States the watchdog considers in-flight and eligible for reclaim
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, OrderState::Processing | OrderState::Sent)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderState {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "pending" => Ok(OrderState::Pending),
            "processing" => Ok(OrderState::Processing),
            "sent" => Ok(OrderState::Sent),
            "filled" => Ok(OrderState::Filled),
            "partially_filled" => Ok(OrderState::PartiallyFilled),
            "failed" => Ok(OrderState::Failed),
            "cancelled" => Ok(OrderState::Cancelled),
            "notified" => Ok(OrderState::Notified),
            "needs_review" => Ok(OrderState::NeedsReview),
            _ => Err(format!("Unknown order state: {}", s)),
        }
    }
}

/// Strategy signal that produced the order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    OpenLong,
    OpenShort,
    AddLong,
    AddShort,
    CloseLong,
    CloseShort,
    ReduceLong,
    ReduceShort,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::OpenLong => "open_long",
            SignalType::OpenShort => "open_short",
            SignalType::AddLong => "add_long",
            SignalType::AddShort => "add_short",
            SignalType::CloseLong => "close_long",
            SignalType::CloseShort => "close_short",
            SignalType::ReduceLong => "reduce_long",
            SignalType::ReduceShort => "reduce_short",
        }
    }

    /// Position side this signal operates on
    pub fn side(&self) -> super::PositionSide {
        use SignalType::*;
        match self {
            OpenLong | AddLong | CloseLong | ReduceLong => super::PositionSide::Long,
            OpenShort | AddShort | CloseShort | ReduceShort => super::PositionSide::Short,
        }
    }

    /// Whether execution increases (Open) or decreases (Close) the position
    pub fn action(&self) -> super::TradeAction {
        use SignalType::*;
        match self {
            OpenLong | OpenShort | AddLong | AddShort => super::TradeAction::Open,
            CloseLong | CloseShort | ReduceLong | ReduceShort => super::TradeAction::Close,
        }
    }

    /// Close signals flatten the whole position; reduce signals take a size
    pub fn closes_fully(&self) -> bool {
        matches!(self, SignalType::CloseLong | SignalType::CloseShort)
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SignalType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "open_long" => Ok(SignalType::OpenLong),
            "open_short" => Ok(SignalType::OpenShort),
            "add_long" => Ok(SignalType::AddLong),
            "add_short" => Ok(SignalType::AddShort),
            "close_long" => Ok(SignalType::CloseLong),
            "close_short" => Ok(SignalType::CloseShort),
            "reduce_long" => Ok(SignalType::ReduceLong),
            "reduce_short" => Ok(SignalType::ReduceShort),
            _ => Err(format!("Unknown signal type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Swap,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Swap => "swap",
        }
    }
}

impl TryFrom<&str> for MarketType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "spot" => Ok(MarketType::Spot),
            "swap" => Ok(MarketType::Swap),
            _ => Err(format!("Unknown market type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
        }
    }
}

impl TryFrom<&str> for OrderKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "market" => Ok(OrderKind::Market),
            "limit" => Ok(OrderKind::Limit),
            _ => Err(format!("Unknown order kind: {}", s)),
        }
    }
}

/// Whether the order is executed against the venue or only announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Auto,
    NotifyOnly,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Auto => "auto",
            ExecutionMode::NotifyOnly => "notify_only",
        }
    }
}

impl TryFrom<&str> for ExecutionMode {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "auto" => Ok(ExecutionMode::Auto),
            "notify_only" => Ok(ExecutionMode::NotifyOnly),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// New-order parameters accepted at the enqueue boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub strategy_id: Option<i64>,
    pub account_id: i64,
    pub symbol: String,
    pub market: MarketType,
    pub signal: SignalType,
    pub kind: OrderKind,
    pub amount: Decimal,
    /// Required for limit orders
    pub price: Option<Decimal>,
    pub mode: ExecutionMode,
    /// Higher priority claims first
    #[serde(default)]
    pub priority: i32,
    /// When the strategy emitted the signal
    pub signal_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(PipelineError::Validation("symbol must not be empty".into()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(PipelineError::Validation(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        match self.kind {
            OrderKind::Limit => {
                let price = self
                    .price
                    .ok_or_else(|| PipelineError::Validation("limit order requires a price".into()))?;
                if price <= Decimal::ZERO {
                    return Err(PipelineError::Validation(format!(
                        "limit price must be positive, got {}",
                        price
                    )));
                }
            }
            OrderKind::Market => {
                if let Some(price) = self.price {
                    if price <= Decimal::ZERO {
                        return Err(PipelineError::Validation(format!(
                            "reference price must be positive, got {}",
                            price
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A persisted order job. The store row is the source of truth; this struct
/// is a snapshot, never a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderJob {
    pub id: i64,
    /// Stable idempotency identity, set once at enqueue
    pub client_order_id: String,
    pub strategy_id: Option<i64>,
    pub account_id: i64,
    pub symbol: String,
    pub market: MarketType,
    pub signal: SignalType,
    pub kind: OrderKind,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub mode: ExecutionMode,
    pub priority: i32,
    pub state: OrderState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    /// Not claimable before this instant (retry backoff)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub exchange_order_id: Option<String>,
    pub raw_response: Option<serde_json::Value>,
    pub filled_amount: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub signal_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OrderJob {
    /// Build a fresh pending job from a validated request
    pub fn from_request(request: OrderRequest, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            client_order_id: Uuid::new_v4().to_string(),
            strategy_id: request.strategy_id,
            account_id: request.account_id,
            symbol: request.symbol,
            market: request.market,
            signal: request.signal,
            kind: request.kind,
            amount: request.amount,
            price: request.price,
            mode: request.mode,
            priority: request.priority,
            state: OrderState::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_attempt_at: None,
            claimed_by: None,
            exchange_order_id: None,
            raw_response: None,
            filled_amount: None,
            avg_fill_price: None,
            signal_at: request.signal_at,
            created_at: now,
            processed_at: None,
            sent_at: None,
            executed_at: None,
            updated_at: now,
        }
    }

    /// Seconds elapsed since the strategy emitted the signal
    pub fn signal_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.signal_at).num_seconds()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        self.signal_age_secs(now) > max_age_secs
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Venue-side execution result reported back through the adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub exchange_order_id: String,
    pub filled_amount: Decimal,
    pub avg_price: Decimal,
    pub commission: Decimal,
    pub raw: Option<serde_json::Value>,
    pub executed_at: DateTime<Utc>,
}
