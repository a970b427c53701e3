use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// +1 for long, -1 for short; multiplies the price move into PnL
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PositionSide {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            _ => Err(format!("Unknown position side: {}", s)),
        }
    }
}

/// Unique identity of a position row. One row per (strategy, symbol, side);
/// manual orders carry no strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub strategy_id: Option<i64>,
    pub symbol: String,
    pub side: PositionSide,
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.strategy_id {
            Some(id) => write!(f, "{}/{}/{}", id, self.symbol, self.side),
            None => write!(f, "manual/{}/{}", self.symbol, self.side),
        }
    }
}

/// Open position, maintained exclusively by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub strategy_id: Option<i64>,
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    /// Volume-weighted average entry price
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub high_watermark: Decimal,
    pub low_watermark: Decimal,
    pub unrealized_pnl: Decimal,
    pub pnl_percent: Decimal,
    /// Entry cost plus unrealized PnL
    pub equity: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn open(key: &PositionKey, price: Decimal, size: Decimal, now: DateTime<Utc>) -> Self {
        let mut position = Self {
            id: 0,
            strategy_id: key.strategy_id,
            symbol: key.symbol.clone(),
            side: key.side,
            size,
            entry_price: price,
            current_price: price,
            high_watermark: price,
            low_watermark: price,
            unrealized_pnl: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
            equity: Decimal::ZERO,
            opened_at: now,
            updated_at: now,
        };
        position.recompute();
        position
    }

    pub fn key(&self) -> PositionKey {
        PositionKey {
            strategy_id: self.strategy_id,
            symbol: self.symbol.clone(),
            side: self.side,
        }
    }

    pub fn cost(&self) -> Decimal {
        self.entry_price * self.size
    }

    pub fn market_value(&self) -> Decimal {
        self.current_price * self.size
    }

    /// Add to the position, re-weighting the entry price by volume
    pub fn add(&mut self, price: Decimal, size: Decimal, now: DateTime<Utc>) {
        let new_size = self.size + size;
        if new_size > Decimal::ZERO {
            self.entry_price = (self.cost() + price * size) / new_size;
        }
        self.size = new_size;
        self.mark(price);
        self.updated_at = now;
        self.recompute();
    }

    /// Reduce the position, returning realized PnL for the closed slice.
    /// Sizes above the open size are clamped by the caller.
    pub fn reduce(&mut self, price: Decimal, size: Decimal, now: DateTime<Utc>) -> Decimal {
        let realized = (price - self.entry_price) * size * self.side.sign();
        self.size -= size;
        self.mark(price);
        self.updated_at = now;
        self.recompute();
        realized
    }

    pub fn is_flat(&self) -> bool {
        self.size <= Decimal::ZERO
    }

    /// Mark-to-market against a fresh price
    pub fn apply_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.mark(price);
        self.updated_at = now;
        self.recompute();
    }

    /// Ticks and fill prices both count toward the watermarks
    fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        if price > self.high_watermark {
            self.high_watermark = price;
        }
        if price < self.low_watermark {
            self.low_watermark = price;
        }
    }

    fn recompute(&mut self) {
        self.unrealized_pnl =
            (self.current_price - self.entry_price) * self.size * self.side.sign();
        let cost = self.cost();
        self.pnl_percent = if cost > Decimal::ZERO {
            self.unrealized_pnl / cost * Decimal::from(100)
        } else {
            Decimal::ZERO
        };
        self.equity = cost + self.unrealized_pnl;
    }
}

/// Portfolio aggregate over all open positions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub position_count: usize,
    pub total_cost: Decimal,
    pub total_value: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub pnl_percent: Decimal,
}

impl PortfolioSummary {
    pub fn from_positions(positions: &[Position]) -> Self {
        let mut summary = Self {
            position_count: positions.len(),
            ..Default::default()
        };
        for position in positions {
            summary.total_cost += position.cost();
            summary.total_value += position.market_value();
            summary.total_unrealized_pnl += position.unrealized_pnl;
        }
        if summary.total_cost > Decimal::ZERO {
            summary.pnl_percent =
                summary.total_unrealized_pnl / summary.total_cost * Decimal::from(100);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_key() -> PositionKey {
        PositionKey {
            strategy_id: Some(1),
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
        }
    }

    #[test]
    fn test_long_pnl_on_price_move() {
        let mut position = Position::open(&long_key(), dec!(50000), dec!(1), Utc::now());
        assert_eq!(position.unrealized_pnl, dec!(0));

        position.apply_price(dec!(51000), Utc::now());
        assert_eq!(position.unrealized_pnl, dec!(1000));
        assert_eq!(position.pnl_percent, dec!(2));
        assert_eq!(position.equity, dec!(51000));
        assert_eq!(position.high_watermark, dec!(51000));
    }

    #[test]
    fn test_short_pnl_inverts() {
        let key = PositionKey {
            side: PositionSide::Short,
            ..long_key()
        };
        let mut position = Position::open(&key, dec!(50000), dec!(2), Utc::now());

        position.apply_price(dec!(49000), Utc::now());
        assert_eq!(position.unrealized_pnl, dec!(2000));

        position.apply_price(dec!(52000), Utc::now());
        assert_eq!(position.unrealized_pnl, dec!(-8000));
        assert_eq!(position.low_watermark, dec!(49000));
        assert_eq!(position.high_watermark, dec!(52000));
    }

    #[test]
    fn test_add_reweights_entry() {
        let mut position = Position::open(&long_key(), dec!(100), dec!(1), Utc::now());
        position.add(dec!(200), dec!(1), Utc::now());

        assert_eq!(position.size, dec!(2));
        assert_eq!(position.entry_price, dec!(150));
    }

    #[test]
    fn test_fill_prices_move_watermarks() {
        let mut position = Position::open(&long_key(), dec!(100), dec!(2), Utc::now());

        position.add(dec!(120), dec!(1), Utc::now());
        assert_eq!(position.high_watermark, dec!(120));
        assert_eq!(position.low_watermark, dec!(100));

        position.reduce(dec!(80), dec!(1), Utc::now());
        assert_eq!(position.low_watermark, dec!(80));
        assert_eq!(position.high_watermark, dec!(120));
    }

    #[test]
    fn test_reduce_realizes_pnl() {
        let mut position = Position::open(&long_key(), dec!(100), dec!(4), Utc::now());
        let realized = position.reduce(dec!(110), dec!(1), Utc::now());

        assert_eq!(realized, dec!(10));
        assert_eq!(position.size, dec!(3));
        assert_eq!(position.entry_price, dec!(100));
        assert!(!position.is_flat());

        let realized = position.reduce(dec!(90), dec!(3), Utc::now());
        assert_eq!(realized, dec!(-30));
        assert!(position.is_flat());
    }

    #[test]
    fn test_portfolio_summary() {
        let mut a = Position::open(&long_key(), dec!(50000), dec!(1), Utc::now());
        a.apply_price(dec!(51000), Utc::now());

        let key_b = PositionKey {
            symbol: "ETH/USDT".to_string(),
            ..long_key()
        };
        let mut b = Position::open(&key_b, dec!(2000), dec!(10), Utc::now());
        b.apply_price(dec!(1900), Utc::now());

        let summary = PortfolioSummary::from_positions(&[a, b]);
        assert_eq!(summary.position_count, 2);
        assert_eq!(summary.total_cost, dec!(70000));
        assert_eq!(summary.total_value, dec!(70000));
        assert_eq!(summary.total_unrealized_pnl, dec!(0));
    }
}
