use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::NotificationConfig;
use crate::error::{PipelineError, Result};

/// Periodic portfolio monitor. The scheduler owns `next_run_at`; manual
/// run-now never touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub name: String,
    /// Empty = report over all open positions
    pub position_ids: Vec<i64>,
    pub interval_min: i64,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub last_result: Option<serde_json::Value>,
    pub run_count: i64,
    pub notification: NotificationConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Monitor {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Validation("monitor name must not be empty".into()));
        }
        if self.interval_min < 1 {
            return Err(PipelineError::Validation(format!(
                "interval_min must be at least 1, got {}",
                self.interval_min
            )));
        }
        self.notification
            .validate()
            .map_err(PipelineError::Validation)?;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at <= now
    }

    /// Next scheduled slot after a run that started at `now`
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::minutes(self.interval_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(interval_min: i64) -> Monitor {
        let now = Utc::now();
        Monitor {
            id: 1,
            name: "daily check".to_string(),
            position_ids: vec![],
            interval_min,
            is_active: true,
            last_run_at: None,
            next_run_at: now,
            last_result: None,
            run_count: 0,
            notification: NotificationConfig::browser_only(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_due_and_reschedule() {
        let m = monitor(30);
        let now = Utc::now();
        assert!(m.is_due(now));
        assert!(!m.is_due(now - Duration::minutes(1)));
        assert_eq!(m.next_run_after(now), now + Duration::minutes(30));
    }

    #[test]
    fn test_inactive_never_due() {
        let mut m = monitor(30);
        m.is_active = false;
        assert!(!m.is_due(Utc::now() + Duration::hours(1)));
    }

    #[test]
    fn test_validation() {
        assert!(monitor(30).validate().is_ok());
        assert!(monitor(0).validate().is_err());
        let mut m = monitor(30);
        m.name = " ".to_string();
        assert!(m.validate().is_err());
    }
}
