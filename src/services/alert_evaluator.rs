use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::{Notifier, Store};
use crate::config::AlertsConfig;
use crate::domain::{AlertRule, NotificationPayload, Position};
use crate::error::{PipelineError, Result};

/// Polling alert evaluation over the position snapshot. Notification
/// delivery is fire-and-forget; a dead webhook never blocks evaluation.
#[derive(Clone)]
pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    config: AlertsConfig,
    running: Arc<AtomicBool>,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<Notifier>, config: AlertsConfig) -> Self {
        Self {
            store,
            notifier,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Alert evaluator already running");
            return;
        }

        info!(
            interval_secs = self.config.poll_interval_secs,
            "Starting alert evaluator"
        );

        let evaluator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                evaluator.config.poll_interval_secs,
            ));
            while evaluator.running.load(Ordering::SeqCst) {
                interval.tick().await;
                match evaluator.run_evaluation_cycle().await {
                    Ok(fired) if fired > 0 => debug!(fired, "alert cycle complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "alert cycle failed"),
                }
            }
            info!("Alert evaluator stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Alert evaluator stop requested");
    }

    /// Evaluate every active rule once, returning the number fired
    pub async fn run_evaluation_cycle(&self) -> Result<usize> {
        let now = Utc::now();
        let mut fired = 0;

        for mut rule in self.store.list_active_alerts().await? {
            let Some(position) = self.store.get_position_by_id(rule.position_id).await? else {
                // Position closed since the rule was created; rule stays
                // dormant until it targets something again
                debug!(alert_id = rule.id, "alert target position gone, skipping");
                continue;
            };

            if !rule.should_fire(&position, now) {
                continue;
            }

            rule.mark_triggered(now);
            self.store.update_alert(&rule).await?;
            fired += 1;

            info!(
                alert_id = rule.id,
                kind = %rule.kind,
                threshold = %rule.threshold,
                symbol = %position.symbol,
                "alert fired"
            );
            self.notifier
                .dispatch(&rule.notification, &Self::render(&rule, &position))
                .await;
        }
        Ok(fired)
    }

    fn render(rule: &AlertRule, position: &Position) -> NotificationPayload {
        NotificationPayload {
            symbol: position.symbol.clone(),
            kind: "alert".to_string(),
            title: format!("Alert: {} {} {}", position.symbol, rule.kind, rule.threshold),
            message: format!(
                "{} {} is at {} (pnl {}%), {} threshold {}",
                position.symbol,
                position.side,
                position.current_price,
                position.pnl_percent.round_dp(2),
                rule.kind,
                rule.threshold
            ),
            payload: Some(json!({
                "alert_id": rule.id,
                "position_id": position.id,
                "kind": rule.kind,
                "threshold": rule.threshold,
                "current_price": position.current_price,
                "pnl_percent": position.pnl_percent,
                "trigger_count": rule.trigger_count,
            })),
        }
    }

    // --- rule management ---

    pub async fn create_rule(&self, rule: AlertRule) -> Result<AlertRule> {
        rule.validate()?;
        if self
            .store
            .get_position_by_id(rule.position_id)
            .await?
            .is_none()
        {
            return Err(PipelineError::NotFound(format!(
                "position {}",
                rule.position_id
            )));
        }
        self.store.insert_alert(&rule).await
    }

    /// Update the user-editable parameters of a rule. Fire bookkeeping
    /// (`is_triggered`, `last_triggered_at`, `trigger_count`) and the
    /// target position are never taken from the caller; re-arming goes
    /// through `reset_rule`.
    pub async fn update_rule(&self, update: AlertRule) -> Result<AlertRule> {
        update.validate()?;
        let mut rule = self
            .store
            .get_alert(update.id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("alert {}", update.id)))?;
        rule.kind = update.kind;
        rule.threshold = update.threshold;
        rule.is_active = update.is_active;
        rule.repeat_interval_min = update.repeat_interval_min;
        rule.notification = update.notification;
        rule.updated_at = Utc::now();
        self.store.update_alert(&rule).await?;
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.store.delete_alert(id).await
    }

    pub async fn list_rules(&self) -> Result<Vec<AlertRule>> {
        self.store.list_alerts().await
    }

    /// Re-arm a fired once-only rule
    pub async fn reset_rule(&self, id: i64) -> Result<AlertRule> {
        let mut rule = self
            .store
            .get_alert(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("alert {}", id)))?;
        rule.reset(Utc::now());
        self.store.update_alert(&rule).await?;
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::config::NotifySettings;
    use crate::domain::{
        AlertKind, NotificationConfig, PositionKey, PositionSide,
    };
    use rust_decimal_macros::dec;

    async fn setup_with_position() -> (Arc<MemoryStore>, AlertEvaluator, Position) {
        let store = Arc::new(MemoryStore::new());
        let notifier =
            Arc::new(Notifier::new(&NotifySettings::default(), store.clone()).unwrap());
        let evaluator = AlertEvaluator::new(store.clone(), notifier, AlertsConfig::default());

        let key = PositionKey {
            strategy_id: Some(1),
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
        };
        let mut position = Position::open(&key, dec!(50000), dec!(1), Utc::now());
        position.apply_price(dec!(51000), Utc::now());
        let position = store.upsert_position(&position).await.unwrap();
        (store, evaluator, position)
    }

    fn rule(position_id: i64, kind: AlertKind, threshold: rust_decimal::Decimal) -> AlertRule {
        AlertRule {
            id: 0,
            position_id,
            kind,
            threshold,
            is_active: true,
            is_triggered: false,
            last_triggered_at: None,
            trigger_count: 0,
            repeat_interval_min: 0,
            notification: NotificationConfig::browser_only(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fires_once_and_notifies() {
        let (store, evaluator, position) = setup_with_position().await;
        evaluator
            .create_rule(rule(position.id, AlertKind::PriceAbove, dec!(50500)))
            .await
            .unwrap();

        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 1);
        // Once-only rule stays quiet on the next cycle
        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 0);

        let rules = evaluator.list_rules().await.unwrap();
        assert!(rules[0].is_triggered);
        assert_eq!(rules[0].trigger_count, 1);
        assert_eq!(store.list_notifications(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_rearms() {
        let (_store, evaluator, position) = setup_with_position().await;
        let created = evaluator
            .create_rule(rule(position.id, AlertKind::PnlAbove, dec!(1)))
            .await
            .unwrap();

        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 1);
        evaluator.reset_rule(created.id).await.unwrap();
        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_cannot_rearm_fired_rule() {
        let (_store, evaluator, position) = setup_with_position().await;
        evaluator
            .create_rule(rule(position.id, AlertKind::PriceAbove, dec!(50500)))
            .await
            .unwrap();
        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 1);

        let mut edit = evaluator.list_rules().await.unwrap().remove(0);
        edit.threshold = dec!(50600);
        edit.is_triggered = false;
        edit.trigger_count = 0;
        edit.last_triggered_at = None;
        let updated = evaluator.update_rule(edit).await.unwrap();

        assert_eq!(updated.threshold, dec!(50600));
        assert!(updated.is_triggered);
        assert_eq!(updated.trigger_count, 1);
        // Still fired: only reset_rule re-arms a once-only rule
        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_condition_not_met_no_fire() {
        let (store, evaluator, position) = setup_with_position().await;
        evaluator
            .create_rule(rule(position.id, AlertKind::PriceAbove, dec!(60000)))
            .await
            .unwrap();

        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 0);
        assert!(store.list_notifications(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_position_skipped() {
        let (store, evaluator, position) = setup_with_position().await;
        evaluator
            .create_rule(rule(position.id, AlertKind::PriceAbove, dec!(1)))
            .await
            .unwrap();
        store.delete_position(&position.key()).await.unwrap();

        assert_eq!(evaluator.run_evaluation_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_requires_existing_position() {
        let (_store, evaluator, _position) = setup_with_position().await;
        let err = evaluator
            .create_rule(rule(999, AlertKind::PriceAbove, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
