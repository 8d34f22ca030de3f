// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Table capacity: the effective session maximum, lowered when memory runs out, and the
//! throttling of the extra flush run above the high watermark.

use crate::config::NatConfig;

#[allow(unused)]
use tracing::{debug, warn};

/// Idle thresholds, in seconds, the extra flush works through after the closing TCP queues.
pub const IDLE_STEPS: [u64; 4] = [5 * 86400, 12 * 3600, 30 * 60, 30];

/// Headroom left below the active count when an allocation fails.
const MEMFAIL_HEADROOM: usize = 100;

#[derive(Debug, Clone)]
pub struct CapacityPolicy {
    max: usize,
    floor: usize,
    wm_high: u8,
    wm_low: u8,
    interval: u64,
    last_flush: Option<u64>,
}

impl CapacityPolicy {
    #[must_use]
    pub fn new(config: &NatConfig) -> Self {
        Self {
            max: config.table_max,
            floor: config.table_size.min(config.table_max),
            wm_high: config.table_wm_high,
            wm_low: config.table_wm_low,
            interval: config.ticks(config.flush_interval_secs),
            last_flush: None,
        }
    }

    /// Sessions the table may hold.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Session memory could not be obtained with `active` sessions live: lower the maximum.
    pub fn on_alloc_failure(&mut self, active: usize) -> usize {
        let lowered = active.saturating_sub(MEMFAIL_HEADROOM).max(self.floor);
        if lowered < self.max {
            warn!("Lowering session table maximum from {} to {lowered}", self.max);
            self.max = lowered;
        }
        self.max
    }

    fn percent(&self, pct: u8) -> usize {
        self.max.saturating_mul(usize::from(pct)) / 100
    }

    #[must_use]
    pub fn above_high(&self, active: usize) -> bool {
        active >= self.percent(self.wm_high)
    }

    /// Occupancy the extra flush aims for.
    #[must_use]
    pub fn low_target(&self) -> usize {
        self.percent(self.wm_low)
    }

    /// Whether an extra flush should run now; if so, it is accounted as started.
    pub fn should_flush(&mut self, active: usize, now: u64) -> bool {
        if !self.above_high(active) {
            return false;
        }
        if self
            .last_flush
            .is_some_and(|last| now.saturating_sub(last) < self.interval)
        {
            return false;
        }
        self.last_flush = Some(now);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> NatConfig {
        NatConfig {
            table_size: 50,
            table_max: 1000,
            table_wm_high: 90,
            table_wm_low: 80,
            flush_interval_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn watermarks_and_throttle() {
        let mut policy = CapacityPolicy::new(&config());
        assert!(!policy.should_flush(899, 0));
        assert!(policy.should_flush(900, 0));
        // 5 seconds are 10 ticks
        assert!(!policy.should_flush(950, 9));
        assert!(policy.should_flush(950, 10));
        assert_eq!(policy.low_target(), 800);
    }

    #[test]
    fn alloc_failure_lowers_max_down_to_the_floor() {
        let mut policy = CapacityPolicy::new(&config());
        assert_eq!(policy.on_alloc_failure(700), 600);
        // never raised again
        assert_eq!(policy.on_alloc_failure(900), 600);
        assert_eq!(policy.on_alloc_failure(120), 50);
    }
}
