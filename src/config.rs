use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::GroupError;

// Protocol defaults
const HEARTBEAT_INTERVAL_MS: u64 = 2000;
const MAX_MISSED_BEATS: u32 = 3;
const VERIFY_TIMEOUT_MS: u64 = 1500;
const PROBE_TIMEOUT_MS: u64 = 2000;
const DISCOVERY_TIMEOUT_MS: u64 = 5000;
const DISCOVERY_ATTEMPTS: u32 = 3;
const BROADCAST_EXPIRY_MS: u64 = 12_000;
const BROADCAST_REAP_INTERVAL_MS: u64 = 18_000;
const PROCESSED_VIEW_EXPIRY_MS: u64 = 30_000;
const FAILURE_REPORT_COOLDOWN_MS: u64 = 30_000;

/// Tunables for one group membership instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GroupConfig {
    pub group_name: String,
    /// Self-report period; also the suspicion scan period.
    pub heartbeat_interval_ms: u64,
    pub max_missed_beats: u32,
    /// Grace period the failure verifier waits before re-checking suspects.
    pub verify_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// How long one master-query round waits for an answer.
    pub discovery_timeout_ms: u64,
    /// How many master-query rounds run before a master is appointed.
    pub discovery_attempts: u32,
    pub broadcast_expiry_ms: u64,
    pub broadcast_reap_interval_ms: u64,
    pub processed_view_expiry_ms: u64,
    pub failure_report_cooldown_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_name: "default".to_string(),
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            max_missed_beats: MAX_MISSED_BEATS,
            verify_timeout_ms: VERIFY_TIMEOUT_MS,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            discovery_timeout_ms: DISCOVERY_TIMEOUT_MS,
            discovery_attempts: DISCOVERY_ATTEMPTS,
            broadcast_expiry_ms: BROADCAST_EXPIRY_MS,
            broadcast_reap_interval_ms: BROADCAST_REAP_INTERVAL_MS,
            processed_view_expiry_ms: PROCESSED_VIEW_EXPIRY_MS,
            failure_report_cooldown_ms: FAILURE_REPORT_COOLDOWN_MS,
        }
    }
}

impl GroupConfig {
    pub fn new(group_name: &str) -> Self {
        Self {
            group_name: group_name.to_string(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: GroupConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("verify_timeout_ms", self.verify_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("broadcast_expiry_ms", self.broadcast_expiry_ms),
            ("broadcast_reap_interval_ms", self.broadcast_reap_interval_ms),
            ("processed_view_expiry_ms", self.processed_view_expiry_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(GroupError::InvalidConfig(format!("{} must be greater than zero", name)).into());
            }
        }
        if self.max_missed_beats == 0 {
            return Err(GroupError::InvalidConfig("max_missed_beats must be greater than zero".into()).into());
        }
        if self.discovery_attempts == 0 {
            return Err(GroupError::InvalidConfig("discovery_attempts must be greater than zero".into()).into());
        }
        if self.group_name.is_empty() {
            return Err(GroupError::InvalidConfig("group_name must not be empty".into()).into());
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn broadcast_expiry(&self) -> Duration {
        Duration::from_millis(self.broadcast_expiry_ms)
    }

    pub fn broadcast_reap_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_reap_interval_ms)
    }

    pub fn processed_view_expiry(&self) -> Duration {
        Duration::from_millis(self.processed_view_expiry_ms)
    }

    pub fn failure_report_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_report_cooldown_ms)
    }

    /// Silence after which a member becomes a suspect.
    pub fn suspicion_threshold(&self) -> Duration {
        self.heartbeat_interval() * self.max_missed_beats
    }
}
