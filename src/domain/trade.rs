use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PositionSide;

/// Direction of a trade relative to the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    /// Opens or adds to a position
    Open,
    /// Closes or reduces a position
    Close,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Open => "open",
            TradeAction::Close => "close",
        }
    }
}

impl TryFrom<&str> for TradeAction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "open" => Ok(TradeAction::Open),
            "close" => Ok(TradeAction::Close),
            _ => Err(format!("Unknown trade action: {}", s)),
        }
    }
}

/// Immutable execution record. Trades are append-only; `trade_uid` is the
/// exactly-once key for ledger application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub trade_uid: String,
    pub order_id: Option<i64>,
    pub strategy_id: Option<i64>,
    pub account_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub action: TradeAction,
    pub price: Decimal,
    pub amount: Decimal,
    /// price * amount
    pub value: Decimal,
    pub commission: Decimal,
    /// Realized PnL, set on closing trades only
    pub profit: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        order_id: Option<i64>,
        strategy_id: Option<i64>,
        account_id: i64,
        symbol: impl Into<String>,
        side: PositionSide,
        action: TradeAction,
        price: Decimal,
        amount: Decimal,
        commission: Decimal,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            trade_uid: Uuid::new_v4().to_string(),
            order_id,
            strategy_id,
            account_id,
            symbol: symbol.into(),
            side,
            action,
            price,
            amount,
            value: price * amount,
            commission,
            profit: None,
            executed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_value() {
        let trade = Trade::new(
            Some(1),
            Some(1),
            1,
            "BTC/USDT",
            PositionSide::Long,
            TradeAction::Open,
            dec!(50000),
            dec!(0.5),
            dec!(12.5),
            Utc::now(),
        );
        assert_eq!(trade.value, dec!(25000));
        assert!(trade.profit.is_none());
        assert!(!trade.trade_uid.is_empty());
    }
}
