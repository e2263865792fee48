// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync coordinator.
//!
//! # Example
//!
//! ```
//! use offline_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.circuit_failure_threshold, 5);
//! assert_eq!(config.cache_max_bytes, 16 * 1024 * 1024);
//!
//! // Partial override from TOML
//! let config = SyncConfig::from_toml_str(r#"
//!     cache_max_entries = 200
//!     store_path = "/data/offline.db"
//! "#).unwrap();
//! assert_eq!(config.cache_max_entries, 200);
//! assert_eq!(config.retry_max_attempts, 3);
//! ```

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::realtime::RealtimeConfig;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tunables for the sync layer.
///
/// All fields have defaults; product caps live here rather than in code.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Consecutive failed calls before the breaker opens
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_open_timeout_ms")]
    pub circuit_open_timeout_ms: u64,

    /// Attempts per breaker admission, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Delay spread as a fraction (0.2 = ±20%)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Realtime reconnect schedule
    #[serde(default = "default_realtime_backoff_base_ms")]
    pub realtime_backoff_base_ms: u64,
    #[serde(default = "default_realtime_backoff_multiplier")]
    pub realtime_backoff_multiplier: f64,
    #[serde(default = "default_realtime_backoff_ceiling_ms")]
    pub realtime_backoff_ceiling_ms: u64,
    /// A connection that lasted this long resets the backoff
    #[serde(default = "default_realtime_reset_after_ms")]
    pub realtime_reset_after_ms: u64,

    /// In-memory cache; 0 entries disables it
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_cache_eviction_fraction")]
    pub cache_eviction_fraction: f64,

    #[serde(default = "default_conflict_history_capacity")]
    pub conflict_history_capacity: usize,
    /// Periodic flush cadence for writes still queued
    #[serde(default = "default_pending_retry_interval_ms")]
    pub pending_retry_interval_ms: u64,
    /// Clean local records older than this are refreshed on read
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_applied_event_capacity")]
    pub applied_event_capacity: usize,
    #[serde(default = "default_connectivity_debounce_ms")]
    pub connectivity_debounce_ms: u64,
    /// Page size when scanning the owner index for dirty records
    #[serde(default = "default_recovery_page_size")]
    pub recovery_page_size: usize,

    /// SQLite file for the offline store (None = in-memory)
    #[serde(default)]
    pub store_path: Option<String>,
}

fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_open_timeout_ms() -> u64 { 60_000 }
fn default_retry_max_attempts() -> usize { 3 }
fn default_retry_base_delay_ms() -> u64 { 200 }
fn default_retry_multiplier() -> f64 { 2.0 }
fn default_retry_max_delay_ms() -> u64 { 5_000 }
fn default_retry_jitter() -> f64 { 0.2 }
fn default_realtime_backoff_base_ms() -> u64 { 1_000 }
fn default_realtime_backoff_multiplier() -> f64 { 2.0 }
fn default_realtime_backoff_ceiling_ms() -> u64 { 30_000 }
fn default_realtime_reset_after_ms() -> u64 { 60_000 }
fn default_cache_max_entries() -> usize { 1_000 }
fn default_cache_max_bytes() -> usize { 16 * 1024 * 1024 } // 16 MiB
fn default_cache_ttl_ms() -> u64 { 300_000 }
fn default_cache_eviction_fraction() -> f64 { 0.1 }
fn default_conflict_history_capacity() -> usize { 50 }
fn default_pending_retry_interval_ms() -> u64 { 30_000 }
fn default_stale_after_ms() -> u64 { 300_000 }
fn default_applied_event_capacity() -> usize { 1_024 }
fn default_connectivity_debounce_ms() -> u64 { 500 }
fn default_recovery_page_size() -> usize { 256 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_open_timeout_ms: default_circuit_open_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
            realtime_backoff_base_ms: default_realtime_backoff_base_ms(),
            realtime_backoff_multiplier: default_realtime_backoff_multiplier(),
            realtime_backoff_ceiling_ms: default_realtime_backoff_ceiling_ms(),
            realtime_reset_after_ms: default_realtime_reset_after_ms(),
            cache_max_entries: default_cache_max_entries(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_eviction_fraction: default_cache_eviction_fraction(),
            conflict_history_capacity: default_conflict_history_capacity(),
            pending_retry_interval_ms: default_pending_retry_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            applied_event_capacity: default_applied_event_capacity(),
            connectivity_debounce_ms: default_connectivity_debounce_ms(),
            recovery_page_size: default_recovery_page_size(),
            store_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no deployment could mean.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }

        if self.circuit_failure_threshold == 0 {
            return Err(invalid("circuit_failure_threshold", "must be at least 1"));
        }
        if self.retry_max_attempts == 0 {
            return Err(invalid("retry_max_attempts", "must be at least 1"));
        }
        for (field, value) in [
            ("retry_multiplier", self.retry_multiplier),
            ("realtime_backoff_multiplier", self.realtime_backoff_multiplier),
        ] {
            if !(value >= 1.0) {
                return Err(invalid(field, format!("{} is below 1.0", value)));
            }
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(invalid("retry_jitter", "must be within [0, 1]"));
        }
        if !(self.cache_eviction_fraction > 0.0 && self.cache_eviction_fraction <= 1.0) {
            return Err(invalid("cache_eviction_fraction", "must be within (0, 1]"));
        }
        if self.realtime_backoff_base_ms > self.realtime_backoff_ceiling_ms {
            return Err(invalid("realtime_backoff_base_ms", "exceeds realtime_backoff_ceiling_ms"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(invalid("retry_base_delay_ms", "exceeds retry_max_delay_ms"));
        }
        if self.pending_retry_interval_ms == 0 {
            return Err(invalid("pending_retry_interval_ms", "must be non-zero"));
        }
        if self.applied_event_capacity == 0 {
            return Err(invalid("applied_event_capacity", "must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: self.retry_multiplier,
            max_retries: Some(self.retry_max_attempts),
            jitter: self.retry_jitter,
        }
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            open_timeout: Duration::from_millis(self.circuit_open_timeout_ms),
        }
    }

    #[must_use]
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            backoff_base: Duration::from_millis(self.realtime_backoff_base_ms),
            backoff_multiplier: self.realtime_backoff_multiplier,
            backoff_ceiling: Duration::from_millis(self.realtime_backoff_ceiling_ms),
            reset_after: Duration::from_millis(self.realtime_reset_after_ms),
            jitter: self.retry_jitter,
        }
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    #[must_use]
    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_millis(self.pending_retry_interval_ms)
    }

    #[must_use]
    pub fn connectivity_debounce(&self) -> Duration {
        Duration::from_millis(self.connectivity_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_open_timeout_ms, 60_000);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.realtime_backoff_ceiling_ms, 30_000);
        assert_eq!(config.cache_max_entries, 1_000);
        assert_eq!(config.cache_max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.conflict_history_capacity, 50);
        assert_eq!(config.applied_event_capacity, 1_024);
        assert!(config.store_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_documents_use_defaults() {
        let json = SyncConfig::from_json_str("{}").unwrap();
        let toml = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(json.stale_after_ms, 300_000);
        assert_eq!(toml.pending_retry_interval_ms, 30_000);
    }

    #[test]
    fn test_json_override() {
        let config = SyncConfig::from_json_str(r#"{"circuit_failure_threshold": 2, "cache_max_entries": 0}"#).unwrap();
        assert_eq!(config.circuit_failure_threshold, 2);
        assert_eq!(config.cache_max_entries, 0);
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = SyncConfig::from_json_str(r#"{"circuit_failure_threshold": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "circuit_failure_threshold", .. }));
    }

    #[test]
    fn test_rejects_shrinking_multiplier() {
        let config = SyncConfig { retry_multiplier: 0.5, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "retry_multiplier", .. })));

        let config = SyncConfig { realtime_backoff_multiplier: f64::NAN, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_eviction_fraction_out_of_range() {
        for fraction in [0.0, -0.1, 1.5] {
            let config = SyncConfig { cache_eviction_fraction: fraction, ..Default::default() };
            assert!(config.validate().is_err(), "fraction {} accepted", fraction);
        }
        let config = SyncConfig { cache_eviction_fraction: 1.0, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(SyncConfig::from_toml_str("cache_max_entries = \"lots\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_derived_configs() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_config().max_retries, Some(3));
        assert_eq!(config.circuit_config().open_timeout, Duration::from_secs(60));
        assert_eq!(config.realtime_config().backoff_ceiling, Duration::from_secs(30));
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.stale_after(), Duration::from_secs(300));
    }
}
