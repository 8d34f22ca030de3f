// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The rule store: the master list of rules plus two mask-bucketed hashes, one for MAP-like rules
//! keyed by source network and one for REDIRECT-like rules keyed by destination network.

use super::{NatRule, NatRuleSpec, RuleError, RuleId, RuleKind};
use crate::NatDirection;
use crate::session::NatTuple;
use ahash::RandomState;
use ipnet::IpNet;
use net::ip::{IpFamily, addr_to_bits};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

#[allow(unused)]
use tracing::{debug, error, info, warn};

/// Hash key of a rule: the family, length and masked bits of its key network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MaskKey {
    family: IpFamily,
    len: u8,
    bits: u128,
}

fn mask(family: IpFamily, len: u8) -> u128 {
    let width = u32::from(family.bits());
    let len = u32::from(len).min(width);
    if len == 0 {
        return 0;
    }
    let ones = u128::MAX << (128 - len);
    // IPv4 addresses occupy the low 32 bits
    ones >> (128 - width)
}

impl MaskKey {
    fn of_net(net: IpNet) -> Self {
        let family = IpFamily::of(&net.addr());
        Self::of_addr(net.addr(), family, net.prefix_len())
    }

    fn of_addr(addr: IpAddr, family: IpFamily, len: u8) -> Self {
        Self {
            family,
            len,
            bits: addr_to_bits(addr) & mask(family, len),
        }
    }
}

/// Rules hashed by the network of one of their predicates.
#[derive(Debug)]
struct MaskedRules {
    hasher: RandomState,
    buckets: Vec<Vec<(MaskKey, Arc<NatRule>)>>,
    /// Rules without a plain key network
    catch_all: Vec<Arc<NatRule>>,
    /// Prefix lengths in use, most specific first, with the number of rules under each
    masks: Vec<(IpFamily, u8, usize)>,
}

impl MaskedRules {
    fn new(size: usize) -> Self {
        Self {
            hasher: RandomState::with_seed(0x6e61_7472),
            buckets: vec![Vec::new(); size.max(1)],
            catch_all: Vec::new(),
            masks: Vec::new(),
        }
    }

    fn slot(&self, key: &MaskKey) -> usize {
        let hash = self.hasher.hash_one(key);
        usize::try_from(hash % self.buckets.len() as u64).unwrap_or_default()
    }

    fn insert(&mut self, key: Option<MaskKey>, rule: Arc<NatRule>) {
        let Some(key) = key else {
            self.catch_all.push(rule);
            return;
        };
        let slot = self.slot(&key);
        self.buckets[slot].push((key, rule));
        match self
            .masks
            .iter_mut()
            .find(|(family, len, _)| *family == key.family && *len == key.len)
        {
            Some((_, _, count)) => *count += 1,
            None => {
                self.masks.push((key.family, key.len, 1));
                self.masks.sort_by(|a, b| b.1.cmp(&a.1));
            }
        }
    }

    fn remove(&mut self, key: Option<MaskKey>, id: RuleId) -> bool {
        let Some(key) = key else {
            let before = self.catch_all.len();
            self.catch_all.retain(|r| r.id() != id);
            return self.catch_all.len() != before;
        };
        let slot = self.slot(&key);
        let bucket = &mut self.buckets[slot];
        let Some(pos) = bucket.iter().position(|(_, r)| r.id() == id) else {
            return false;
        };
        bucket.remove(pos);
        if let Some(at) = self
            .masks
            .iter()
            .position(|(family, len, _)| *family == key.family && *len == key.len)
        {
            self.masks[at].2 -= 1;
            if self.masks[at].2 == 0 {
                self.masks.remove(at);
            }
        }
        true
    }

    /// Move a rule behind the rules sharing its key.
    fn rotate(&mut self, key: Option<MaskKey>, id: RuleId) {
        let chain: &mut Vec<_> = match key {
            None => {
                if let Some(pos) = self.catch_all.iter().position(|r| r.id() == id) {
                    let rule = self.catch_all.remove(pos);
                    self.catch_all.push(rule);
                }
                return;
            }
            Some(key) => {
                let slot = self.slot(&key);
                &mut self.buckets[slot]
            }
        };
        if let Some(pos) = chain.iter().position(|(_, r)| r.id() == id) {
            let entry = chain.remove(pos);
            chain.push(entry);
        }
    }

    /// Rules keyed under a network containing `addr`, most specific mask first, then the
    /// catch-all rules.
    fn candidates(&self, addr: IpAddr, out: &mut Vec<Arc<NatRule>>) {
        let family = IpFamily::of(&addr);
        for (_, len, _) in self.masks.iter().filter(|(f, _, _)| *f == family) {
            let key = MaskKey::of_addr(addr, family, *len);
            let bucket = &self.buckets[self.slot(&key)];
            out.extend(
                bucket
                    .iter()
                    .filter(|(k, _)| *k == key)
                    .map(|(_, r)| r.clone()),
            );
        }
        out.extend(self.catch_all.iter().cloned());
    }
}

/// All configured rules.
#[derive(Debug)]
pub struct RuleStore {
    /// In insertion order, which is also id order
    rules: Vec<Arc<NatRule>>,
    map: MaskedRules,
    rdr: MaskedRules,
    next_id: u32,
    proxies: BTreeSet<String>,
}

impl RuleStore {
    #[must_use]
    pub fn new(hash_size: usize) -> Self {
        Self {
            rules: Vec::new(),
            map: MaskedRules::new(hash_size),
            rdr: MaskedRules::new(hash_size),
            next_id: 1,
            proxies: BTreeSet::new(),
        }
    }

    /// Key of the rule in the outbound hash, `None` when it does not live there.
    fn map_key(rule: &NatRule) -> Option<Option<MaskKey>> {
        match rule.kind() {
            RuleKind::Map | RuleKind::MapBlock | RuleKind::Divert | RuleKind::Bimap => {
                Some(rule.spec().src.plain_net().map(MaskKey::of_net))
            }
            RuleKind::Redirect => None,
        }
    }

    /// Key of the rule in the inbound hash, `None` when it does not live there.
    fn rdr_key(rule: &NatRule) -> Option<Option<MaskKey>> {
        match rule.kind() {
            RuleKind::Redirect => Some(rule.spec().dst.plain_net().map(MaskKey::of_net)),
            RuleKind::Bimap => Some(rule.nets().map(|nets| MaskKey::of_net(nets.pool))),
            RuleKind::Map | RuleKind::MapBlock | RuleKind::Divert => None,
        }
    }

    /// Register a proxy name rules may refer to.
    pub fn register_proxy(&mut self, name: &str) -> bool {
        self.proxies.insert(name.to_string())
    }

    #[must_use]
    pub fn has_proxy(&self, name: &str) -> bool {
        self.proxies.contains(name)
    }

    /// Validate `spec` and make it live.
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` if the spec is invalid, refers to an unknown proxy or reuses the
    /// name of another rule.
    pub fn add_rule(&mut self, spec: NatRuleSpec) -> Result<Arc<NatRule>, RuleError> {
        if let Some(proxy) = &spec.proxy
            && !self.proxies.contains(proxy)
        {
            return Err(RuleError::UnknownProxy(proxy.clone()));
        }
        if let Some(name) = &spec.name
            && self.find_by_name(name).is_some()
        {
            return Err(RuleError::DuplicateName(name.clone()));
        }
        let rule = Arc::new(NatRule::new(RuleId(self.next_id), spec)?);
        self.next_id += 1;
        if let Some(key) = Self::map_key(&rule) {
            self.map.insert(key, rule.clone());
        }
        if let Some(key) = Self::rdr_key(&rule) {
            self.rdr.insert(key, rule.clone());
        }
        self.rules.push(rule.clone());
        info!("Added rule {rule}");
        Ok(rule)
    }

    /// Unlink a rule. It stays alive, flagged deleted, for as long as sessions reference it.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` if there is no such rule.
    pub fn remove_rule(&mut self, id: RuleId) -> Result<Arc<NatRule>, RuleError> {
        let pos = self
            .rules
            .iter()
            .position(|r| r.id() == id)
            .ok_or(RuleError::NotFound(id))?;
        let rule = self.rules.remove(pos);
        if let Some(key) = Self::map_key(&rule)
            && !self.map.remove(key, id)
        {
            error!("Rule {id} was missing from the outbound hash");
        }
        if let Some(key) = Self::rdr_key(&rule)
            && !self.rdr.remove(key, id)
        {
            error!("Rule {id} was missing from the inbound hash");
        }
        rule.mark_deleted();
        info!(
            "Removed rule {id} ({} sessions still reference it)",
            rule.use_count()
        );
        Ok(rule)
    }

    /// Rules that may translate `flow` travelling in `dir`, in the order they must be tried.
    /// The predicates still have to be evaluated.
    #[must_use]
    pub fn candidates(&self, dir: NatDirection, flow: &NatTuple) -> Vec<Arc<NatRule>> {
        let mut out = Vec::new();
        match dir {
            NatDirection::Outbound => self.map.candidates(flow.src, &mut out),
            NatDirection::Inbound => self.rdr.candidates(flow.dst, &mut out),
        }
        out.retain(|r| r.applies_to(dir));
        out
    }

    /// Move a round-robin rule behind its peers after it created a session.
    pub fn rotate(&mut self, rule: &NatRule) {
        if let Some(key) = Self::map_key(rule) {
            self.map.rotate(key, rule.id());
        }
        if let Some(key) = Self::rdr_key(rule) {
            self.rdr.rotate(key, rule.id());
        }
    }

    #[must_use]
    pub fn get(&self, id: RuleId) -> Option<&Arc<NatRule>> {
        self.rules.iter().find(|r| r.id() == id)
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<NatRule>> {
        self.rules.iter().find(|r| r.name() == Some(name))
    }

    /// A live rule built from an identical (normalized) spec.
    #[must_use]
    pub fn find_by_spec(&self, spec: &NatRuleSpec) -> Option<&Arc<NatRule>> {
        self.rules.iter().find(|r| r.spec() == spec)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<NatRule>> {
        self.rules.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
