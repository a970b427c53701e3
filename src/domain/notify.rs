use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Delivery channel for alert and monitor notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    /// Persisted in-app notification row
    Browser,
    Telegram,
    Webhook,
    Discord,
}

impl NotifyChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyChannel::Browser => "browser",
            NotifyChannel::Telegram => "telegram",
            NotifyChannel::Webhook => "webhook",
            NotifyChannel::Discord => "discord",
        }
    }

    /// Channels that require a delivery target
    pub fn requires_target(&self) -> bool {
        !matches!(self, NotifyChannel::Browser)
    }
}

impl std::fmt::Display for NotifyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for NotifyChannel {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "browser" => Ok(NotifyChannel::Browser),
            "telegram" => Ok(NotifyChannel::Telegram),
            "webhook" => Ok(NotifyChannel::Webhook),
            "discord" => Ok(NotifyChannel::Discord),
            _ => Err(format!("Unknown notification channel: {}", s)),
        }
    }
}

/// Typed notification routing attached to alert rules and monitors.
///
/// Targets: telegram uses `chat_id` (or `bot_token|chat_id` to override the
/// shared token), webhook and discord use a full URL. Browser needs no target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channels: Vec<NotifyChannel>,
    #[serde(default)]
    pub targets: HashMap<NotifyChannel, String>,
}

impl NotificationConfig {
    pub fn browser_only() -> Self {
        Self {
            channels: vec![NotifyChannel::Browser],
            targets: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Boundary validation: every non-browser channel needs a target, and
    /// URL-shaped targets must actually parse.
    pub fn validate(&self) -> Result<(), String> {
        for channel in &self.channels {
            let target = self.targets.get(channel).map(String::as_str);

            if channel.requires_target() && target.map_or(true, |t| t.trim().is_empty()) {
                return Err(format!("channel {} requires a target", channel));
            }

            if matches!(channel, NotifyChannel::Webhook | NotifyChannel::Discord) {
                let target = target.unwrap_or_default();
                let url = Url::parse(target)
                    .map_err(|e| format!("channel {} target is not a valid URL: {}", channel, e))?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(format!(
                        "channel {} target must be http(s), got {}",
                        channel,
                        url.scheme()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A rendered notification ready for channel fan-out
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub symbol: String,
    /// Source category, e.g. "alert", "monitor", "order_failed"
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Persisted in-app notification row (browser channel sink)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserNotification {
    pub id: i64,
    pub symbol: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_needs_no_target() {
        let config = NotificationConfig::browser_only();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_telegram_requires_target() {
        let config = NotificationConfig {
            channels: vec![NotifyChannel::Telegram],
            targets: HashMap::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_webhook_target_must_be_url() {
        let mut targets = HashMap::new();
        targets.insert(NotifyChannel::Webhook, "not a url".to_string());
        let config = NotificationConfig {
            channels: vec![NotifyChannel::Webhook],
            targets,
        };
        assert!(config.validate().is_err());

        let mut targets = HashMap::new();
        targets.insert(
            NotifyChannel::Webhook,
            "https://example.com/hook".to_string(),
        );
        let config = NotificationConfig {
            channels: vec![NotifyChannel::Webhook],
            targets,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_channel_round_trip() {
        for s in ["browser", "telegram", "webhook", "discord"] {
            let channel = NotifyChannel::try_from(s).unwrap();
            assert_eq!(channel.as_str(), s);
        }
        assert!(NotifyChannel::try_from("email").is_err());
    }
}
