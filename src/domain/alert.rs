use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{NotificationConfig, Position};
use crate::error::{PipelineError, Result};

/// Condition an alert rule watches on its position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PriceAbove,
    PriceBelow,
    PnlAbove,
    PnlBelow,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PriceAbove => "price_above",
            AlertKind::PriceBelow => "price_below",
            AlertKind::PnlAbove => "pnl_above",
            AlertKind::PnlBelow => "pnl_below",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AlertKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "price_above" => Ok(AlertKind::PriceAbove),
            "price_below" => Ok(AlertKind::PriceBelow),
            "pnl_above" => Ok(AlertKind::PnlAbove),
            "pnl_below" => Ok(AlertKind::PnlBelow),
            _ => Err(format!("Unknown alert kind: {}", s)),
        }
    }
}

/// Threshold rule targeting one position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub position_id: i64,
    pub kind: AlertKind,
    pub threshold: Decimal,
    pub is_active: bool,
    pub is_triggered: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
    /// 0 = fire once, stays triggered until reset
    pub repeat_interval_min: i64,
    pub notification: NotificationConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn validate(&self) -> Result<()> {
        if self.repeat_interval_min < 0 {
            return Err(PipelineError::Validation(
                "repeat_interval_min must not be negative".into(),
            ));
        }
        if matches!(self.kind, AlertKind::PriceAbove | AlertKind::PriceBelow)
            && self.threshold <= Decimal::ZERO
        {
            return Err(PipelineError::Validation(format!(
                "price threshold must be positive, got {}",
                self.threshold
            )));
        }
        self.notification
            .validate()
            .map_err(PipelineError::Validation)?;
        Ok(())
    }

    /// Whether the position currently satisfies the rule condition.
    /// PnL kinds compare against `pnl_percent`.
    pub fn condition_met(&self, position: &Position) -> bool {
        match self.kind {
            AlertKind::PriceAbove => position.current_price >= self.threshold,
            AlertKind::PriceBelow => position.current_price <= self.threshold,
            AlertKind::PnlAbove => position.pnl_percent >= self.threshold,
            AlertKind::PnlBelow => position.pnl_percent <= self.threshold,
        }
    }

    /// Repeat gating: once-only rules stay silent after their first fire;
    /// repeating rules wait out the interval since the last fire.
    pub fn can_trigger(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if self.repeat_interval_min == 0 {
            return !self.is_triggered;
        }
        match self.last_triggered_at {
            Some(last) => now - last >= Duration::minutes(self.repeat_interval_min),
            None => true,
        }
    }

    pub fn should_fire(&self, position: &Position, now: DateTime<Utc>) -> bool {
        self.can_trigger(now) && self.condition_met(position)
    }

    /// Mutations applied when the rule fires
    pub fn mark_triggered(&mut self, now: DateTime<Utc>) {
        self.is_triggered = true;
        self.last_triggered_at = Some(now);
        self.trigger_count += 1;
        self.updated_at = now;
    }

    /// Manual reset re-arms a once-only rule
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.is_triggered = false;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PositionKey, PositionSide};
    use rust_decimal_macros::dec;

    fn rule(kind: AlertKind, threshold: Decimal, repeat_min: i64) -> AlertRule {
        AlertRule {
            id: 1,
            position_id: 1,
            kind,
            threshold,
            is_active: true,
            is_triggered: false,
            last_triggered_at: None,
            trigger_count: 0,
            repeat_interval_min: repeat_min,
            notification: NotificationConfig::browser_only(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn position_at(price: Decimal) -> Position {
        let key = PositionKey {
            strategy_id: Some(1),
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
        };
        let mut position = Position::open(&key, dec!(50000), dec!(1), Utc::now());
        position.apply_price(price, Utc::now());
        position
    }

    #[test]
    fn test_price_conditions() {
        let position = position_at(dec!(51000));
        assert!(rule(AlertKind::PriceAbove, dec!(50500), 0).condition_met(&position));
        assert!(!rule(AlertKind::PriceAbove, dec!(52000), 0).condition_met(&position));
        assert!(rule(AlertKind::PriceBelow, dec!(51000), 0).condition_met(&position));
    }

    #[test]
    fn test_pnl_conditions_use_percent() {
        // 50000 -> 51000 on a long is +2%
        let position = position_at(dec!(51000));
        assert!(rule(AlertKind::PnlAbove, dec!(2), 0).condition_met(&position));
        assert!(!rule(AlertKind::PnlAbove, dec!(3), 0).condition_met(&position));
        assert!(rule(AlertKind::PnlBelow, dec!(5), 0).condition_met(&position));
    }

    #[test]
    fn test_once_only_fires_once_until_reset() {
        let position = position_at(dec!(51000));
        let mut alert = rule(AlertKind::PriceAbove, dec!(50500), 0);
        let now = Utc::now();

        assert!(alert.should_fire(&position, now));
        alert.mark_triggered(now);
        assert_eq!(alert.trigger_count, 1);
        assert!(!alert.should_fire(&position, now));

        alert.reset(now);
        assert!(alert.should_fire(&position, now));
    }

    #[test]
    fn test_repeat_interval_gates_refire() {
        let position = position_at(dec!(51000));
        let mut alert = rule(AlertKind::PriceAbove, dec!(50500), 15);
        let now = Utc::now();

        alert.mark_triggered(now);
        assert!(!alert.should_fire(&position, now + Duration::minutes(10)));
        assert!(alert.should_fire(&position, now + Duration::minutes(15)));
    }

    #[test]
    fn test_inactive_never_fires() {
        let position = position_at(dec!(51000));
        let mut alert = rule(AlertKind::PriceAbove, dec!(50500), 0);
        alert.is_active = false;
        assert!(!alert.should_fire(&position, Utc::now()));
    }

    #[test]
    fn test_validation() {
        assert!(rule(AlertKind::PriceAbove, dec!(0), 0).validate().is_err());
        assert!(rule(AlertKind::PnlBelow, dec!(-5), 0).validate().is_ok());
        let mut alert = rule(AlertKind::PriceAbove, dec!(100), 0);
        alert.repeat_interval_min = -1;
        assert!(alert.validate().is_err());
    }
}
