//! Retry and conflict policies

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a pulled record is merged over a local row
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The pulled copy always overwrites the local row, including one with
    /// an unsynced edit
    #[default]
    ArrivalOrder,
    /// Keep an unsynced local row whose `updated_at` is newer than the
    /// pulled copy
    PreferNewerPending,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ArrivalOrder => "arrival_order",
            ConflictPolicy::PreferNewerPending => "prefer_newer_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arrival_order" => Some(ConflictPolicy::ArrivalOrder),
            "prefer_newer_pending" => Some(ConflictPolicy::PreferNewerPending),
            _ => None,
        }
    }
}

/// Attempt ceiling, backoff schedule and request timeout for pushes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a queue item is marked failed
    pub max_attempts: u32,
    /// Delay after the first rejected attempt
    pub base_delay: Duration,
    /// Upper bound on any backoff delay
    pub max_delay: Duration,
    /// Timeout applied to every remote request
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff after `attempts` rejected attempts: `base * 2^(attempts-1)`,
    /// capped at `max_delay`
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Time left before an item last attempted at `last_attempt_at` may be
    /// retried
    pub fn remaining_backoff(
        &self,
        attempts: u32,
        last_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        let Some(last) = last_attempt_at else {
            return Duration::ZERO;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        self.backoff_for(attempts).saturating_sub(elapsed)
    }
}
