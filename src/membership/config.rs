//! Gossip Timing Configuration
//!
//! Every node of a cluster is expected to run with the same `GossipConfig`.
//! The values are read once at construction and never change afterwards.

use anyhow::{Result, bail};
use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_FAILURE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_FAILURE_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_FANOUT: usize = 3;

/// Timing and fanout parameters of the gossip protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipConfig {
    /// Silence after which a peer is considered failed.
    pub failure_timeout: Duration,
    /// Extra grace period after `failure_timeout` before a failed peer is forgotten.
    pub cleanup_timeout: Duration,
    /// Period of the disseminator loop.
    pub update_interval: Duration,
    /// Period of the failure detector loop.
    pub failure_check_interval: Duration,
    /// Number of peers contacted per gossip round.
    pub fanout: usize,
}

impl GossipConfig {
    pub fn new(
        failure_timeout: Duration,
        cleanup_timeout: Duration,
        update_interval: Duration,
        failure_check_interval: Duration,
        fanout: usize,
    ) -> Self {
        Self {
            failure_timeout,
            cleanup_timeout,
            update_interval,
            failure_check_interval,
            fanout,
        }
    }

    /// Builds a config from `GOSSIP_*` environment variables.
    ///
    /// Durations are given in milliseconds. Missing or unparsable variables
    /// fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            failure_timeout: env_millis("GOSSIP_FAILURE_TIMEOUT_MS")
                .unwrap_or(defaults.failure_timeout),
            cleanup_timeout: env_millis("GOSSIP_CLEANUP_TIMEOUT_MS")
                .unwrap_or(defaults.cleanup_timeout),
            update_interval: env_millis("GOSSIP_UPDATE_INTERVAL_MS")
                .unwrap_or(defaults.update_interval),
            failure_check_interval: env_millis("GOSSIP_FAILURE_CHECK_INTERVAL_MS")
                .unwrap_or(defaults.failure_check_interval),
            fanout: std::env::var("GOSSIP_FANOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fanout),
        }
    }

    pub fn with_failure_timeout(mut self, timeout: Duration) -> Self {
        self.failure_timeout = timeout;
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_failure_check_interval(mut self, interval: Duration) -> Self {
        self.failure_check_interval = interval;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Rejects values that would stall a loop, disable dissemination or overflow the send pool.
    ///
    /// `tokio::time::interval` panics on a zero period, so both intervals must be non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.update_interval.is_zero() {
            bail!("update_interval must be greater than zero");
        }
        if self.failure_check_interval.is_zero() {
            bail!("failure_check_interval must be greater than zero");
        }
        if self.fanout == 0 {
            bail!("fanout must be at least 1");
        }
        // Sends per round are bounded by a semaphore with `fanout` permits.
        if self.fanout > Semaphore::MAX_PERMITS {
            bail!("fanout must not exceed {}", Semaphore::MAX_PERMITS);
        }
        Ok(())
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            failure_timeout: DEFAULT_FAILURE_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            failure_check_interval: DEFAULT_FAILURE_CHECK_INTERVAL,
            fanout: DEFAULT_FANOUT,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
