// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Engine configuration: table sizing, timeouts and the rules loaded at start-up.

use crate::rules::NatRuleSpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Idle timeouts, in seconds, per protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatTimeouts {
    pub tcp_syn_sent: u64,
    pub tcp_syn_received: u64,
    pub tcp_established: u64,
    pub tcp_fin_wait: u64,
    pub tcp_closing: u64,
    pub tcp_time_wait: u64,
    pub tcp_closed: u64,
    pub udp: u64,
    pub icmp: u64,
    pub ip: u64,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            tcp_syn_sent: 120,
            tcp_syn_received: 60,
            tcp_established: 5 * 86400,
            tcp_fin_wait: 240,
            tcp_closing: 120,
            tcp_time_wait: 120,
            tcp_closed: 30,
            udp: 120,
            icmp: 60,
            ip: 120,
        }
    }
}

/// Configuration of a [`crate::NatEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatConfig {
    /// Buckets in each of the two session indices
    pub table_size: usize,
    /// Upper bound on live sessions
    pub table_max: usize,
    /// Longest chain allowed in one session bucket
    pub max_bucket: usize,
    /// Occupancy (percent of `table_max`) above which an extra flush is attempted
    pub table_wm_high: u8,
    /// Occupancy (percent of `table_max`) an extra flush aims for
    pub table_wm_low: u8,
    /// Entries in the host-map cache
    pub hostmap_size: usize,
    /// Buckets in each of the two rule hashes
    pub rule_hash_size: usize,
    /// Length of a tick, in milliseconds
    pub tick_ms: u64,
    /// Minimum time between two extra flushes, in seconds
    pub flush_interval_secs: u64,
    /// Lifetime of a fragment train entry, in seconds
    pub frag_timeout_secs: u64,
    /// Entries in the fragment cache
    pub frag_max: usize,
    /// Upper bound on candidates examined by one allocation
    pub alloc_search_limit: u64,
    /// Seed of the session hash; random when unset
    pub hash_seed: Option<u64>,
    pub timeouts: NatTimeouts,
    pub rules: Vec<NatRuleSpec>,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            table_size: 2047,
            table_max: 30000,
            max_bucket: 24,
            table_wm_high: 99,
            table_wm_low: 90,
            hostmap_size: 2047,
            rule_hash_size: 127,
            tick_ms: 500,
            flush_interval_secs: 5,
            frag_timeout_secs: 60,
            frag_max: 1024,
            alloc_search_limit: 1 << 20,
            hash_seed: None,
            timeouts: NatTimeouts::default(),
            rules: Vec::new(),
        }
    }
}

impl NatConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: NatConfig =
            serde_yaml_ng::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("table_size", self.table_size),
            ("table_max", self.table_max),
            ("max_bucket", self.max_bucket),
            ("hostmap_size", self.hostmap_size),
            ("rule_hash_size", self.rule_hash_size),
            ("frag_max", self.frag_max),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be non-zero".to_string(),
                });
            }
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tick_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.alloc_search_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "alloc_search_limit",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.table_wm_low > self.table_wm_high || self.table_wm_high > 100 {
            return Err(ConfigError::Invalid {
                field: "table_wm_low",
                reason: format!(
                    "watermarks must satisfy low <= high <= 100 (low {}, high {})",
                    self.table_wm_low, self.table_wm_high
                ),
            });
        }
        Ok(())
    }

    /// Convert seconds into engine ticks (at least one tick).
    #[must_use]
    pub fn ticks(&self, secs: u64) -> u64 {
        let ms = u128::from(secs) * 1000;
        let ticks = ms / u128::from(self.tick_ms.max(1));
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
