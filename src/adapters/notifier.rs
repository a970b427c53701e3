use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NotifySettings;
use crate::domain::{NotificationConfig, NotificationPayload, NotifyChannel};
use crate::error::{PipelineError, Result};

use super::store::Store;

/// Best-effort notification fan-out. Channel failures are logged and never
/// propagate to the caller; delivery is not transactional with anything.
pub struct Notifier {
    client: Client,
    store: Arc<dyn Store>,
    telegram_bot_token: Option<String>,
}

impl Notifier {
    pub fn new(settings: &NotifySettings, store: Arc<dyn Store>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            store,
            telegram_bot_token: settings.telegram_bot_token.clone(),
        })
    }

    /// Fan the payload out over every configured channel
    pub async fn dispatch(&self, config: &NotificationConfig, payload: &NotificationPayload) {
        for channel in &config.channels {
            let target = config.targets.get(channel).map(String::as_str);
            if let Err(e) = self.send_one(*channel, target, payload).await {
                warn!(
                    channel = %channel,
                    kind = %payload.kind,
                    error = %e,
                    "notification delivery failed"
                );
            } else {
                debug!(channel = %channel, kind = %payload.kind, "notification delivered");
            }
        }
    }

    async fn send_one(
        &self,
        channel: NotifyChannel,
        target: Option<&str>,
        payload: &NotificationPayload,
    ) -> Result<()> {
        match channel {
            NotifyChannel::Browser => self.store.insert_notification(payload).await,
            NotifyChannel::Telegram => {
                let target = target
                    .ok_or_else(|| PipelineError::Validation("telegram target missing".into()))?;
                self.send_telegram(target, payload).await
            }
            NotifyChannel::Webhook => {
                let target = target
                    .ok_or_else(|| PipelineError::Validation("webhook target missing".into()))?;
                self.send_webhook(target, payload).await
            }
            NotifyChannel::Discord => {
                let target = target
                    .ok_or_else(|| PipelineError::Validation("discord target missing".into()))?;
                self.send_discord(target, payload).await
            }
        }
    }

    async fn send_telegram(&self, target: &str, payload: &NotificationPayload) -> Result<()> {
        let (token, chat_id) = match target.split_once('|') {
            Some((token, chat_id)) => (token.to_string(), chat_id),
            None => {
                let token = self.telegram_bot_token.clone().ok_or_else(|| {
                    PipelineError::Validation("no telegram bot token configured".into())
                })?;
                (token, target)
            }
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let body = json!({
            "chat_id": chat_id,
            "text": format!("{}\n{}", payload.title, payload.message),
        });
        let response = self.client.post(&url).json(&body).send().await?;
        response.error_for_status()?;
        Ok(())
    }

    async fn send_webhook(&self, target: &str, payload: &NotificationPayload) -> Result<()> {
        let response = self.client.post(target).json(payload).send().await?;
        response.error_for_status()?;
        Ok(())
    }

    async fn send_discord(&self, target: &str, payload: &NotificationPayload) -> Result<()> {
        let body = json!({
            "content": format!("**{}**\n{}", payload.title, payload.message),
        });
        let response = self.client.post(target).json(&body).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;

    #[tokio::test]
    async fn test_browser_channel_persists() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(&NotifySettings::default(), store.clone()).unwrap();

        let payload = NotificationPayload {
            symbol: "BTC/USDT".to_string(),
            kind: "alert".to_string(),
            title: "price alert".to_string(),
            message: "BTC/USDT crossed 50000".to_string(),
            payload: None,
        };
        notifier
            .dispatch(&NotificationConfig::browser_only(), &payload)
            .await;

        let rows = store.list_notifications(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "price alert");
    }

    #[tokio::test]
    async fn test_missing_target_does_not_panic() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(&NotifySettings::default(), store.clone()).unwrap();

        let config = NotificationConfig {
            channels: vec![NotifyChannel::Telegram],
            targets: Default::default(),
        };
        let payload = NotificationPayload {
            symbol: "BTC/USDT".to_string(),
            kind: "alert".to_string(),
            title: "t".to_string(),
            message: "m".to_string(),
            payload: None,
        };
        // Delivery fails, but dispatch is best-effort and must not error
        notifier.dispatch(&config, &payload).await;
        assert!(store.list_notifications(10).await.unwrap().is_empty());
    }
}
