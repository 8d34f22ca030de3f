// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Engine counters.

use crate::session::table::BucketStats;
use crate::session::timeout::QueueStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Event counters, updated without locks.
        #[derive(Debug, Default)]
        pub struct NatStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// A copy of the counters at one point in time.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct NatCounters {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl NatStats {
            #[must_use]
            pub fn read(&self) -> NatCounters {
                NatCounters {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Sessions created
    created,
    /// Packets rewritten
    translated,
    /// Packets no session and no rule applied to
    passed,
    /// Packets blocked because translation failed
    blocked,
    /// Allocation searches that found the pool exhausted
    exhausted,
    /// Insertions refused by a full bucket of the original-tuple index
    bucket_max_orig,
    /// Insertions refused by a full bucket of the translated-tuple index
    bucket_max_xlat,
    /// Creations refused because the table reached its maximum
    table_max,
    /// Session memory allocation failures
    memfail,
    /// Sessions removed by the timeout sweep
    expired,
    /// Sessions removed by a flush
    flushed,
    /// Extra flushes run under table pressure
    extra_flush,
    /// Wildcard sessions promoted
    promoted,
    /// ICMP errors matched to a session and repaired
    icmp_translated,
    /// ICMP errors for which no session was found
    icmp_miss,
    /// Non-first fragments matched to a session
    frag_hit,
    /// Non-first fragments without a known train
    frag_miss,
    /// Fragment trains not remembered because the cache was full
    frag_full,
    /// Sessions imported from sync records
    imported,
}

impl NatStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

/// Statistics of an engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NatStatsSnapshot {
    pub counters: NatCounters,
    /// Live sessions
    pub sessions: usize,
    /// Current session maximum
    pub table_max: usize,
    pub rules: usize,
    pub hostmaps: usize,
    /// Fragment trains being tracked
    pub fragments: usize,
    /// Current tick
    pub now: u64,
    pub buckets: [BucketStats; 2],
    pub queues: Vec<QueueStats>,
}
