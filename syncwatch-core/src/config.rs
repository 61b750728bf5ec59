//! Sync timing configuration
//!
//! Every window and interval the synchronizer, membership engine and
//! presence tracker use lives here so hosts can tune them without touching
//! the algorithms.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sync config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid sync config: {0}")]
    Invalid(String),
}

/// Timing knobs for one room session (all values in milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// How often the store row is re-read to catch lost broadcasts
    pub reconcile_interval_ms: u64,
    /// Minimum gap between two effective reconciliations
    pub reconcile_min_interval_ms: u64,
    /// Reconciliation is skipped this long after any play/pause
    pub reconcile_suppress_after_play_pause_ms: u64,
    /// Advisory events are suppressed this long after a play/pause
    pub play_pause_lock_ms: u64,
    /// Advisory events are suppressed this long after a video change
    pub change_video_lock_ms: u64,
    /// At most one outbound seek broadcast per window
    pub seek_throttle_ms: u64,
    /// At most one seek-driven store write per window
    pub seek_write_debounce_ms: u64,
    /// A playing row older than this is treated as an idle room
    pub staleness_threshold_ms: u64,
    /// Store-change fallback never overrides a broadcast younger than this
    pub fallback_recency_window_ms: u64,
    /// Own ban status is polled this often
    pub ban_poll_interval_ms: u64,
    /// Presence heartbeat period
    pub presence_heartbeat_ms: u64,
    /// A member without a heartbeat for this long is offline
    pub presence_timeout_ms: u64,
    /// Upper bound for a join attempt
    pub join_timeout_ms: u64,
    /// Poll period for stores without a push change feed
    pub change_poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 5_000,
            reconcile_min_interval_ms: 3_000,
            reconcile_suppress_after_play_pause_ms: 5_000,
            play_pause_lock_ms: 800,
            change_video_lock_ms: 1_500,
            seek_throttle_ms: 150,
            seek_write_debounce_ms: 1_000,
            staleness_threshold_ms: 5 * 60 * 1_000,
            fallback_recency_window_ms: 10_000,
            ban_poll_interval_ms: 5_000,
            presence_heartbeat_ms: 30_000,
            presence_timeout_ms: 75_000,
            join_timeout_ms: 15_000,
            change_poll_interval_ms: 2_000,
        }
    }
}

impl SyncConfig {
    /// Load a config from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would spin timers in a busy loop
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periodic = [
            ("reconcileIntervalMs", self.reconcile_interval_ms),
            ("banPollIntervalMs", self.ban_poll_interval_ms),
            ("presenceHeartbeatMs", self.presence_heartbeat_ms),
            ("changePollIntervalMs", self.change_poll_interval_ms),
        ];
        for (name, value) in periodic {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.presence_timeout_ms < self.presence_heartbeat_ms {
            return Err(ConfigError::Invalid(
                "presenceTimeoutMs must be at least presenceHeartbeatMs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn ban_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ban_poll_interval_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn change_poll_interval(&self) -> Duration {
        Duration::from_millis(self.change_poll_interval_ms)
    }
}
