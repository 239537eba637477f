use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Backoff;

/// Transfer tuning consumed by [`PersistentTransferSet`](crate::PersistentTransferSet).
///
/// Every field has a default so partial configuration files load cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XferConfig {
    /// Upload ceiling in bytes per second (0 = unlimited).
    #[serde(default)]
    pub max_bytes_sec_up: u64,
    /// Download ceiling in bytes per second (0 = unlimited).
    #[serde(default)]
    pub max_bytes_sec_down: u64,
    /// Give up on a logical transfer this long after its first attempt.
    #[serde(default = "default_give_up_after_secs")]
    pub give_up_after_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Random spread applied to each retry delay, as a fraction.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds without any byte moving before an attempt times out.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Largest single socket read or write.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_give_up_after_secs() -> u64 {
    14 * 24 * 60 * 60
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_max_secs() -> u64 {
    4 * 60 * 60
}

fn default_backoff_jitter() -> f64 {
    0.25
}

fn default_connect_timeout_secs() -> u64 {
    gridxfer_transfer::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_idle_timeout_secs() -> u64 {
    gridxfer_transfer::DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_block_size() -> usize {
    gridxfer_transfer::DEFAULT_BLOCK_SIZE
}

impl Default for XferConfig {
    fn default() -> Self {
        Self {
            max_bytes_sec_up: 0,
            max_bytes_sec_down: 0,
            give_up_after_secs: default_give_up_after_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            backoff_jitter: default_backoff_jitter(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            block_size: default_block_size(),
        }
    }
}

impl XferConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs),
        )
        .with_jitter(self.backoff_jitter)
    }

    /// Retry policy applied to every logical transfer created from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff(),
            give_up_after: Duration::from_secs(self.give_up_after_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            block_size: self.block_size.max(1),
        }
    }
}

/// Timing rules of one logical transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub give_up_after: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub block_size: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        XferConfig::default().retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = XferConfig::default();
        assert_eq!(config.max_bytes_sec_up, 0);
        assert_eq!(config.give_up_after_secs, 1_209_600);
        assert_eq!(config.backoff_base_secs, 60);
        assert_eq!(config.backoff_max_secs, 14_400);
        assert_eq!(config.connect_timeout_secs, 60);
        assert_eq!(config.idle_timeout_secs, 300);
        assert_eq!(config.block_size, 16 * 1024);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: XferConfig =
            serde_json::from_str(r#"{"max_bytes_sec_down": 1000, "backoff_jitter": 0.0}"#)
                .unwrap();
        assert_eq!(config.max_bytes_sec_down, 1000);
        assert_eq!(config.backoff_jitter, 0.0);
        assert_eq!(config.idle_timeout_secs, 300);
    }

    #[test]
    fn policy_from_config() {
        let config = XferConfig {
            give_up_after_secs: 60,
            backoff_base_secs: 1,
            backoff_max_secs: 16,
            backoff_jitter: 0.0,
            block_size: 0,
            ..XferConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.give_up_after, Duration::from_secs(60));
        assert_eq!(policy.backoff.delay_for_attempt(6), Duration::from_secs(16));
        assert_eq!(policy.block_size, 1);
    }
}
