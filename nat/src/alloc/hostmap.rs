// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Sticky translations per host pair.
//!
//! Sessions own their [`HostMap`]; the cache only keeps a weak reference, so a map is gone once
//! the last session using it is. Dead entries are dropped when their last session is retired,
//! when a lookup finds them, or when the cache is full.

use crate::rules::RuleId;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

#[allow(unused)]
use tracing::{debug, warn};

/// The translation chosen for traffic of one rule between two hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostMap {
    pub rule: RuleId,
    pub orig_src: IpAddr,
    pub orig_dst: IpAddr,
    pub xlat: IpAddr,
    /// Translated port, for sticky redirects
    pub port: Option<u16>,
}

impl HostMap {
    fn key(&self) -> HostKey {
        (self.rule, self.orig_src, self.orig_dst)
    }
}

type HostKey = (RuleId, IpAddr, IpAddr);

#[derive(Debug)]
pub struct HostMapCache {
    entries: HashMap<HostKey, Weak<HostMap>, RandomState>,
    max: usize,
}

impl HostMapCache {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::new()),
            max: max.max(1),
        }
    }

    #[must_use]
    pub fn get(&self, rule: RuleId, orig_src: IpAddr, orig_dst: IpAddr) -> Option<Arc<HostMap>> {
        self.entries
            .get(&(rule, orig_src, orig_dst))
            .and_then(Weak::upgrade)
    }

    /// Remember a host map. The caller must hand the returned map to a session, or it is
    /// forgotten. When the cache is full of live entries, the map is returned without being
    /// cached.
    pub fn insert(&mut self, map: HostMap) -> Arc<HostMap> {
        let key = map.key();
        if let Some(existing) = self.entries.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        self.entries.remove(&key);
        if self.entries.len() >= self.max {
            self.prune();
        }
        let map = Arc::new(map);
        if self.entries.len() < self.max {
            self.entries.insert(key, Arc::downgrade(&map));
        } else {
            warn!("Host map cache is full ({} entries)", self.max);
        }
        map
    }

    /// Forget `map` once no session holds it any more. Returns true if the entry was dropped.
    pub fn release(&mut self, map: &HostMap) -> bool {
        let key = map.key();
        let dead = self
            .entries
            .get(&key)
            .is_some_and(|entry| entry.strong_count() == 0);
        if dead {
            self.entries.remove(&key);
        }
        dead
    }

    /// Drop entries no session references. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, map| map.strong_count() > 0);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!("Pruned {pruned} unused host maps");
        }
        pruned
    }

    /// Forget every entry of a rule.
    pub fn remove_rule(&mut self, rule: RuleId) {
        self.entries.retain(|(r, _, _), _| *r != rule);
    }

    /// Number of maps some session still uses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|map| map.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in a stable order, for walking.
    #[must_use]
    pub fn sorted(&self) -> Vec<Arc<HostMap>> {
        let mut maps: Vec<Arc<HostMap>> = self.entries.values().filter_map(Weak::upgrade).collect();
        maps.sort_by_key(|m| m.key());
        maps
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn map(src: &str) -> HostMap {
        HostMap {
            rule: RuleId(1),
            orig_src: src.parse().unwrap(),
            orig_dst: "93.184.1.1".parse().unwrap(),
            xlat: "203.0.113.7".parse().unwrap(),
            port: None,
        }
    }

    #[test]
    fn shared_by_host_pair() {
        let mut cache = HostMapCache::new(8);
        let a = cache.insert(map("10.0.0.5"));
        let b = cache.insert(map("10.0.0.5"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        let found = cache
            .get(RuleId(1), "10.0.0.5".parse().unwrap(), "93.184.1.1".parse().unwrap())
            .unwrap();
        assert_eq!(found.xlat, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert!(cache.get(RuleId(2), a.orig_src, a.orig_dst).is_none());
    }

    #[test]
    fn prune_drops_unreferenced() {
        let mut cache = HostMapCache::new(2);
        let held = cache.insert(map("10.0.0.5"));
        drop(cache.insert(map("10.0.0.6")));
        // full: the unreferenced entry makes room
        let _third = cache.insert(map("10.0.0.7"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(RuleId(1), held.orig_src, held.orig_dst).is_some());
        cache.remove_rule(RuleId(1));
        assert!(cache.is_empty());
    }

    #[test]
    fn released_with_its_last_holder() {
        let mut cache = HostMapCache::new(8);
        let first = cache.insert(map("10.0.0.5"));
        let second = cache.insert(map("10.0.0.5"));
        drop(first);
        assert!(!cache.release(&second));
        assert_eq!(cache.len(), 1);
        let key = (*second).clone();
        drop(second);
        assert_eq!(cache.len(), 0);
        assert!(cache.release(&key));
        assert!(cache.get(RuleId(1), key.orig_src, key.orig_dst).is_none());
        assert!(cache.sorted().is_empty());
    }
}
