//! Configuration for the tile-fetch scheduler
//!
//! [`TileQueueConfig`] carries every knob of the queue and its dispatcher. It can be
//! built from a preset, tweaked field by field, or loaded from a (partial) JSON
//! document. Durations are kept as plain milliseconds so the serialized shape stays
//! flat; the typed accessors return [`Duration`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, TileError};

/// Configuration for the tile queue and its request dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileQueueConfig {
    /// Maximum tiles loading at the same time
    pub max_concurrent: usize,
    /// Retries after the first failed attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for each further retry
    pub retry_delay_base_ms: u64,
    /// Ceiling for the backoff delay
    pub retry_delay_max_ms: u64,
    /// Bound on a single load attempt
    pub request_timeout_ms: u64,
    /// Live tile count above which loaded tiles are evicted
    pub max_cache_size: usize,
    pub enable_lru: bool,
    /// Order each wave by descending priority (insertion order otherwise)
    pub enable_priority: bool,
    /// Rolling window of load-time samples kept for percentiles
    pub max_load_time_samples: usize,
}

impl Default for TileQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 3,
            retry_delay_base_ms: 1000,
            retry_delay_max_ms: 10_000,
            request_timeout_ms: 30_000,
            max_cache_size: 1000,
            enable_lru: true,
            enable_priority: true,
            max_load_time_samples: 1000,
        }
    }
}

impl TileQueueConfig {
    pub fn low_resource() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 2,
            max_cache_size: 256,
            ..Self::default()
        }
    }

    pub fn high_performance() -> Self {
        Self {
            max_concurrent: 16,
            max_retries: 3,
            retry_delay_base_ms: 250,
            retry_delay_max_ms: 5000,
            request_timeout_ms: 15_000,
            max_cache_size: 4096,
            ..Self::default()
        }
    }

    /// Short delays and no retries, for tests driving the queue with fake loaders
    pub fn for_testing() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 0,
            retry_delay_base_ms: 10,
            retry_delay_max_ms: 100,
            request_timeout_ms: 1000,
            max_cache_size: 1000,
            ..Self::default()
        }
    }

    /// Load a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TileError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(TileError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(TileError::InvalidConfig(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry_delay_base_ms > self.retry_delay_max_ms {
            return Err(TileError::InvalidConfig(format!(
                "retry_delay_base_ms ({}) exceeds retry_delay_max_ms ({})",
                self.retry_delay_base_ms, self.retry_delay_max_ms
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn retry_delay_max(&self) -> Duration {
        Duration::from_millis(self.retry_delay_max_ms)
    }
}

/// The part of [`TileQueueConfig`] the request dispatcher needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub retry_delay_max: Duration,
    pub request_timeout: Duration,
    pub max_load_time_samples: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&TileQueueConfig::default())
    }
}

impl From<&TileQueueConfig> for DispatcherConfig {
    fn from(config: &TileQueueConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_retries: config.max_retries,
            retry_delay_base: config.retry_delay_base(),
            retry_delay_max: config.retry_delay_max(),
            request_timeout: config.request_timeout(),
            max_load_time_samples: config.max_load_time_samples,
        }
    }
}

impl DispatcherConfig {
    /// Delay before retry `k` (1-based): `min(base * 2^(k-1), max)`
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.retry_delay_base
            .saturating_mul(factor)
            .min(self.retry_delay_max)
    }
}
