//! Configuration types

use crate::{CimCacheError, CimCacheResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strong repository entries untouched this long are demoted to weak.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(15 * 60);

/// Period of the repository sweep.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Delay between liveness probes while tasks are outstanding.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(5000);

/// Upper bound on a single liveness read.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Polling interval requested for instance-event subscriptions.
pub const DEFAULT_EVENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cache substrate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Inactivity after which a strong repository entry is demoted
    pub inactivity_threshold: Duration,
    /// How often the repository sweep runs
    pub sweep_period: Duration,
    /// Delay between liveness probes
    pub probe_interval: Duration,
    /// Timeout for one liveness read
    pub probe_timeout: Duration,
    /// Interval requested from the event source for instance events
    pub event_poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            event_poll_interval: DEFAULT_EVENT_POLL_INTERVAL,
        }
    }
}

fn env_duration(var: &str, unit: fn(u64) -> Duration, fallback: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(unit)
        .unwrap_or(fallback)
}

impl CacheConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CIMCACHE_INACTIVITY_THRESHOLD_SECS` (default: 900)
    /// - `CIMCACHE_SWEEP_PERIOD_SECS` (default: 600)
    /// - `CIMCACHE_PROBE_INTERVAL_MS` (default: 5000)
    /// - `CIMCACHE_PROBE_TIMEOUT_MS` (default: 5000)
    /// - `CIMCACHE_EVENT_POLL_INTERVAL_MS` (default: 2000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            inactivity_threshold: env_duration(
                "CIMCACHE_INACTIVITY_THRESHOLD_SECS",
                Duration::from_secs,
                defaults.inactivity_threshold,
            ),
            sweep_period: env_duration(
                "CIMCACHE_SWEEP_PERIOD_SECS",
                Duration::from_secs,
                defaults.sweep_period,
            ),
            probe_interval: env_duration(
                "CIMCACHE_PROBE_INTERVAL_MS",
                Duration::from_millis,
                defaults.probe_interval,
            ),
            probe_timeout: env_duration(
                "CIMCACHE_PROBE_TIMEOUT_MS",
                Duration::from_millis,
                defaults.probe_timeout,
            ),
            event_poll_interval: env_duration(
                "CIMCACHE_EVENT_POLL_INTERVAL_MS",
                Duration::from_millis,
                defaults.event_poll_interval,
            ),
        }
    }

    /// Builder-style override of the probe interval.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Builder-style override of the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Builder-style override of the sweep timings.
    pub fn with_sweep(mut self, period: Duration, inactivity_threshold: Duration) -> Self {
        self.sweep_period = period;
        self.inactivity_threshold = inactivity_threshold;
        self
    }

    /// Validate the configuration.
    ///
    /// Every timer period must be positive. The inactivity threshold may be
    /// zero.
    pub fn validate(&self) -> CimCacheResult<()> {
        let positive = [
            ("sweep_period", self.sweep_period),
            ("probe_interval", self.probe_interval),
            ("probe_timeout", self.probe_timeout),
            ("event_poll_interval", self.event_poll_interval),
        ];

        for (field, value) in positive {
            if value.is_zero() {
                return Err(CimCacheError::Config(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: format!("{:?}", value),
                    reason: format!("{} must be positive", field),
                }));
            }
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
