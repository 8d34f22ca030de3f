// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The session table: an arena of sessions plus two bucket indices over it, one keyed by the
//! original tuple and one keyed by the translated tuple.

use super::{NatSession, NatTuple, SessionId, SessionTuples, WildPorts};
use crate::NatDirection;
use ahash::RandomState;
use serde::Serialize;
use std::sync::Arc;

#[allow(unused)]
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TableSide {
    /// Index keyed by the original tuple
    Original,
    /// Index keyed by the translated tuple
    Translated,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum TableError {
    #[error("bucket of the {0} index is full")]
    BucketFull(TableSide),
    #[error("session table is full")]
    TableFull,
    #[error("a session with the same tuple exists")]
    Duplicate,
    #[error("failed to allocate a session slot")]
    AllocFailed,
    #[error("session {0} is gone")]
    NotFound(SessionId),
}

/// Occupancy of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub side: TableSide,
    pub buckets: usize,
    pub in_use: usize,
    pub longest_chain: usize,
    pub entries: usize,
}

#[derive(Debug)]
struct BucketIndex {
    side: TableSide,
    buckets: Vec<Vec<SessionId>>,
    entries: usize,
}

impl BucketIndex {
    fn new(side: TableSide, size: usize) -> Self {
        Self {
            side,
            buckets: vec![Vec::new(); size.max(1)],
            entries: 0,
        }
    }

    fn slot(&self, hash: u64) -> usize {
        usize::try_from(hash % self.buckets.len() as u64).unwrap_or_default()
    }

    fn chain(&self, hash: u64) -> &[SessionId] {
        &self.buckets[self.slot(hash)]
    }

    fn chain_len(&self, hash: u64) -> usize {
        self.chain(hash).len()
    }

    fn link(&mut self, hash: u64, id: SessionId) {
        let slot = self.slot(hash);
        self.buckets[slot].push(id);
        self.entries += 1;
    }

    fn unlink(&mut self, hash: u64, id: SessionId) -> bool {
        let slot = self.slot(hash);
        let chain = &mut self.buckets[slot];
        if let Some(pos) = chain.iter().position(|s| *s == id) {
            chain.remove(pos);
            self.entries -= 1;
            true
        } else {
            false
        }
    }

    fn stats(&self) -> BucketStats {
        BucketStats {
            side: self.side,
            buckets: self.buckets.len(),
            in_use: self.buckets.iter().filter(|b| !b.is_empty()).count(),
            longest_chain: self.buckets.iter().map(Vec::len).max().unwrap_or(0),
            entries: self.entries,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    session: Option<Arc<NatSession>>,
}

#[derive(Debug)]
pub struct SessionTable {
    hasher: RandomState,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_orig: BucketIndex,
    by_xlat: BucketIndex,
    max_chain: usize,
    live: usize,
}

impl SessionTable {
    #[must_use]
    pub fn new(size: usize, max_chain: usize, seed: Option<u64>) -> Self {
        let hasher = match seed {
            Some(seed) => RandomState::with_seeds(seed, !seed, seed.rotate_left(17), 0x5eed),
            None => RandomState::new(),
        };
        Self {
            hasher,
            slots: Vec::new(),
            free: Vec::new(),
            by_orig: BucketIndex::new(TableSide::Original, size),
            by_xlat: BucketIndex::new(TableSide::Translated, size),
            max_chain: max_chain.max(1),
            live: 0,
        }
    }

    fn hash(&self, dir: NatDirection, tuple: &NatTuple) -> u64 {
        self.hasher.hash_one((dir, tuple))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Arc<NatSession>> {
        let slot = self.slots.get(usize::try_from(id.index).ok()?)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.session.as_ref()
    }

    fn find(
        &self,
        side: TableSide,
        dir: NatDirection,
        key: &NatTuple,
        accept: impl Fn(&SessionTuples) -> bool,
    ) -> Option<&Arc<NatSession>> {
        let hash = self.hash(dir, key);
        let index = match side {
            TableSide::Original => &self.by_orig,
            TableSide::Translated => &self.by_xlat,
        };
        index
            .chain(hash)
            .iter()
            .filter_map(|id| self.get(*id))
            .find(|s| {
                if s.dir() != dir {
                    return false;
                }
                let tuples = s.tuples();
                let stored = match side {
                    TableSide::Original => &tuples.orig,
                    TableSide::Translated => &tuples.xlat,
                };
                stored == key && accept(&tuples)
            })
    }

    /// The concrete session initiated in `dir` whose original tuple is `key`.
    #[must_use]
    pub fn lookup_by_original(
        &self,
        dir: NatDirection,
        key: &NatTuple,
    ) -> Option<&Arc<NatSession>> {
        self.find(TableSide::Original, dir, key, |t| !t.is_wild())
    }

    /// The concrete session initiated in `dir` whose translated tuple is `key`.
    #[must_use]
    pub fn lookup_by_translated(
        &self,
        dir: NatDirection,
        key: &NatTuple,
    ) -> Option<&Arc<NatSession>> {
        self.find(TableSide::Translated, dir, key, |t| !t.is_wild())
    }

    /// A wildcard session initiated in `dir` compatible with `flow`, searched in the index of
    /// `side`. `flow` is in the orientation of that index.
    #[must_use]
    pub fn find_wildcard(
        &self,
        side: TableSide,
        dir: NatDirection,
        flow: &NatTuple,
    ) -> Option<&Arc<NatSession>> {
        [WildPorts::SPORT, WildPorts::DPORT, WildPorts::all()]
            .into_iter()
            .find_map(|wild| self.find(side, dir, &flow.masked(wild), |t| t.wild == wild))
    }

    /// Whether a candidate translated tuple for a session initiated in `dir` would be ambiguous:
    /// either another session already translates to it, or its replies would look like the
    /// first packets of a session initiated the other way.
    #[must_use]
    pub fn collides(&self, dir: NatDirection, candidate: &NatTuple) -> bool {
        self.find(TableSide::Translated, dir, candidate, |_| true)
            .is_some()
            || self
                .find(
                    TableSide::Original,
                    dir.reverse(),
                    &candidate.reversed(),
                    |_| true,
                )
                .is_some()
    }

    fn next_id(&self) -> SessionId {
        match self.free.last() {
            Some(index) => SessionId {
                index: *index,
                generation: self.slots[*index as usize].generation,
            },
            None => SessionId {
                index: u32::try_from(self.slots.len()).unwrap_or(u32::MAX),
                generation: 0,
            },
        }
    }

    fn check(
        &self,
        dir: NatDirection,
        tuples: &SessionTuples,
        skip: Option<SessionId>,
    ) -> Result<(u64, u64), TableError> {
        let orig_hash = self.hash(dir, &tuples.orig);
        let xlat_hash = self.hash(dir, &tuples.xlat);
        let exact = |t: &SessionTuples| t.wild == tuples.wild;
        let same = |s: &Arc<NatSession>| Some(s.id()) != skip;
        if self
            .find(TableSide::Original, dir, &tuples.orig, exact)
            .is_some_and(same)
            || self
                .find(TableSide::Translated, dir, &tuples.xlat, exact)
                .is_some_and(same)
        {
            return Err(TableError::Duplicate);
        }
        if self.by_orig.chain_len(orig_hash) >= self.max_chain {
            return Err(TableError::BucketFull(TableSide::Original));
        }
        if self.by_xlat.chain_len(xlat_hash) >= self.max_chain {
            return Err(TableError::BucketFull(TableSide::Translated));
        }
        Ok((orig_hash, xlat_hash))
    }

    /// Build a session under the id it will get and link it into both indices.
    ///
    /// # Errors
    ///
    /// Fails if a session with the same tuples exists, if a bucket is full, or if the arena
    /// cannot grow. The built session is dropped in that case.
    pub fn insert(
        &mut self,
        build: impl FnOnce(SessionId) -> NatSession,
    ) -> Result<Arc<NatSession>, TableError> {
        let id = self.next_id();
        if id.index == u32::MAX {
            return Err(TableError::TableFull);
        }
        if self.free.is_empty() && self.slots.try_reserve(1).is_err() {
            return Err(TableError::AllocFailed);
        }
        let session = Arc::new(build(id));
        let tuples = session.tuples();
        let (orig_hash, xlat_hash) = self.check(session.dir(), &tuples, None)?;

        if self.free.pop().is_none() {
            self.slots.push(Slot::default());
        }
        let slot = &mut self.slots[id.index as usize];
        slot.session = Some(session.clone());
        self.by_orig.link(orig_hash, id);
        self.by_xlat.link(xlat_hash, id);
        self.live += 1;
        Ok(session)
    }

    /// Unlink a session from both indices and free its slot.
    pub fn remove(&mut self, id: SessionId) -> Option<Arc<NatSession>> {
        let session = self.get(id)?.clone();
        let tuples = session.tuples();
        let dir = session.dir();
        let orig_hash = self.hash(dir, &tuples.orig);
        let xlat_hash = self.hash(dir, &tuples.xlat);
        if !self.by_orig.unlink(orig_hash, id) || !self.by_xlat.unlink(xlat_hash, id) {
            error!("Session {id} was not linked in both indices");
        }
        let slot = &mut self.slots[id.index as usize];
        slot.session = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        session.retire();
        Some(session)
    }

    /// Fill the wildcard ports of a session from `flow` and move it to the buckets of its
    /// concrete tuples. Nothing changes if that fails.
    ///
    /// # Errors
    ///
    /// Fails if another session already owns the concrete tuples or a bucket is full.
    pub fn promote(
        &mut self,
        id: SessionId,
        flow: &NatTuple,
    ) -> Result<Arc<NatSession>, TableError> {
        let session = self.get(id).ok_or(TableError::NotFound(id))?.clone();
        let old = session.tuples();
        if !old.is_wild() {
            return Ok(session);
        }
        let new = old.promoted(flow);
        let dir = session.dir();
        let (orig_hash, xlat_hash) = self.check(dir, &new, Some(id))?;
        let old_orig = self.hash(dir, &old.orig);
        let old_xlat = self.hash(dir, &old.xlat);
        self.by_orig.unlink(old_orig, id);
        self.by_xlat.unlink(old_xlat, id);
        self.by_orig.link(orig_hash, id);
        self.by_xlat.link(xlat_hash, id);
        session.set_tuples(new);
        Ok(session)
    }

    /// Live sessions, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<NatSession>> {
        self.slots.iter().filter_map(|s| s.session.as_ref())
    }

    /// The first live session at or after slot `index`, with its slot.
    #[must_use]
    pub fn next_from(&self, index: usize) -> Option<(usize, &Arc<NatSession>)> {
        self.slots
            .iter()
            .enumerate()
            .skip(index)
            .find_map(|(i, s)| s.session.as_ref().map(|s| (i, s)))
    }

    #[must_use]
    pub fn stats(&self) -> [BucketStats; 2] {
        [self.by_orig.stats(), self.by_xlat.stats()]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::rules::{NatRule, NatRuleSpec, PoolSpec, RuleId};
    use net::ip::NextHeader;
    use std::net::IpAddr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn rule() -> Arc<NatRule> {
        let spec = NatRuleSpec::map(
            "10.0.0.0/24".parse().unwrap(),
            PoolSpec::Addr(addr("203.0.113.5")),
        );
        Arc::new(NatRule::new(RuleId(1), spec).unwrap())
    }

    fn tuples(sport: u16, xport: u16) -> SessionTuples {
        let orig = NatTuple::new(NextHeader::UDP, addr("10.0.0.5"), sport, addr("93.184.1.1"), 53);
        let xlat = NatTuple {
            src: addr("203.0.113.5"),
            sport: xport,
            ..orig
        };
        SessionTuples::new(orig, xlat, WildPorts::empty())
    }

    fn insert(
        table: &mut SessionTable,
        rule: &Arc<NatRule>,
        t: SessionTuples,
    ) -> Result<Arc<NatSession>, TableError> {
        table.insert(|id| NatSession::new(id, NatDirection::Outbound, rule.clone(), None, t, 0))
    }

    #[test]
    fn insert_lookup_remove() {
        let rule = rule();
        let mut table = SessionTable::new(31, 4, Some(1));
        let s = insert(&mut table, &rule, tuples(4000, 20000)).unwrap();
        assert_eq!(rule.use_count(), 1);
        let t = s.tuples();
        let out = NatDirection::Outbound;
        assert_eq!(table.lookup_by_original(out, &t.orig).unwrap().id(), s.id());
        assert_eq!(table.lookup_by_translated(out, &t.xlat).unwrap().id(), s.id());
        assert!(table.lookup_by_original(NatDirection::Inbound, &t.orig).is_none());
        assert!(table.collides(out, &t.xlat));
        assert_eq!(
            insert(&mut table, &rule, tuples(4000, 20001)).unwrap_err(),
            TableError::Duplicate
        );

        let removed = table.remove(s.id()).unwrap();
        assert!(!removed.is_live());
        assert!(table.get(s.id()).is_none());
        assert!(table.lookup_by_original(out, &t.orig).is_none());
        drop((removed, s));
        assert_eq!(rule.use_count(), 0);

        // the slot is reused under a new generation
        let again = insert(&mut table, &rule, tuples(4000, 20000)).unwrap();
        assert_eq!(again.id().index, 0);
        assert_eq!(again.id().generation, 1);
        assert_eq!(table.stats()[0].entries, 1);
    }

    #[test]
    fn bucket_cap() {
        let rule = rule();
        // a single bucket per index
        let mut table = SessionTable::new(1, 2, Some(1));
        insert(&mut table, &rule, tuples(1, 101)).unwrap();
        insert(&mut table, &rule, tuples(2, 102)).unwrap();
        assert_eq!(
            insert(&mut table, &rule, tuples(3, 103)).unwrap_err(),
            TableError::BucketFull(TableSide::Original)
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.stats()[1].longest_chain, 2);
        // the rejected session released its rule reference
        assert_eq!(rule.use_count(), 2);
    }

    #[test]
    fn wildcard_promotion_happens_once() {
        let rule = rule();
        let mut table = SessionTable::new(31, 4, Some(7));
        let mut wild = tuples(0, 0);
        wild.wild = WildPorts::SPORT;
        let s = insert(&mut table, &rule, wild).unwrap();
        let out = NatDirection::Outbound;
        let flow = NatTuple::new(NextHeader::UDP, addr("10.0.0.5"), 5555, addr("93.184.1.1"), 53);
        assert!(table.lookup_by_original(out, &flow).is_none());
        let found = table.find_wildcard(TableSide::Original, out, &flow).unwrap().clone();
        assert_eq!(found.id(), s.id());
        let promoted = table.promote(found.id(), &flow).unwrap();
        assert!(!promoted.tuples().is_wild());
        assert_eq!(table.lookup_by_original(out, &flow).unwrap().id(), s.id());
        assert!(table.find_wildcard(TableSide::Original, out, &flow).is_none());
        // promoting again is a no-op
        let twice = table.promote(s.id(), &flow).unwrap();
        assert_eq!(twice.tuples().orig, flow);
        assert_eq!(table.stats()[0].entries, 1);
    }
}
