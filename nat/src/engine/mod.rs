// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The NAT engine: per-packet session lookup, creation and rewrite, in both directions.
//!
//! State shared by all packets lives behind one reader-writer lock. The fast path (a packet of
//! a known session) only takes it for reading. Creation is serialized by a separate mutex so
//! that two first packets of the same flow racing each other yield a single session: the loser
//! finds the winner's session when it looks again under the lock.
//!
//! Locks are always taken in the order creation -> state -> timeout queues. The fragment cache
//! and the capacity policy have their own mutexes, never held while taking another lock.

mod control;
mod icmp;
mod translate;

#[cfg(test)]
mod test;

use crate::alloc::hostmap::{HostMap, HostMapCache};
use crate::alloc::{AllocError, Allocator};
use crate::config::{ConfigError, NatConfig};
use crate::frag::{FragCache, Role};
use crate::lookup::{AddrTables, InterfaceResolver, NamedTables, StaticInterfaces};
use crate::pressure::{CapacityPolicy, IDLE_STEPS};
use crate::rules::{NatRule, RuleError, RuleFlags, RuleId, RuleStore};
use crate::session::{
    NatSession, NatTuple, QueueId, SessionId, SessionTable, SessionTuples, TableError, TableSide,
    TcpState, TimeoutQueues, WildPorts,
};
use crate::stats::NatStats;
use crate::NatDirection;
use net::ip::NextHeader;
use net::packet::{EditError, Packet, Transport};
use net::tcp::TcpFlags;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[allow(unused)]
use tracing::{debug, error, info, warn};

/// Why a packet was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockReason {
    /// Every matching rule ran out of translations
    Exhausted,
    /// A bucket of one of the session indices is full
    BucketFull(TableSide),
    /// The table holds its maximum number of sessions
    TableFull,
    /// Session memory could not be allocated
    MemFail,
    /// The rule cannot translate this packet
    Unsupported,
    /// The datagram could not be rewritten
    Edit,
    /// The session conflicts with an existing one
    Conflict,
}

/// The outcome of processing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatVerdict {
    /// No session and no rule applied, the packet is untouched
    Pass,
    /// The packet belongs to a session and was rewritten or annotated
    Translated,
    /// Translation was required but failed; the packet is marked bad-NAT
    Block(BlockReason),
}

impl NatVerdict {
    /// The classic return value: 0 pass, 1 translated, -1 blocked.
    #[must_use]
    pub fn rval(&self) -> i32 {
        match self {
            NatVerdict::Pass => 0,
            NatVerdict::Translated => 1,
            NatVerdict::Block(_) => -1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error("session table holds its maximum of {0} sessions")]
    TableMax(usize),
    #[error("no session {0}")]
    NoSession(SessionId),
}

impl NatError {
    #[must_use]
    pub fn block_reason(&self) -> BlockReason {
        match self {
            NatError::Alloc(AllocError::Exhausted) => BlockReason::Exhausted,
            NatError::Alloc(_) | NatError::Config(_) | NatError::Rule(_) => {
                BlockReason::Unsupported
            }
            NatError::Table(TableError::BucketFull(side)) => BlockReason::BucketFull(*side),
            NatError::Table(TableError::TableFull) | NatError::TableMax(_) => {
                BlockReason::TableFull
            }
            NatError::Table(TableError::AllocFailed) => BlockReason::MemFail,
            NatError::Table(TableError::Duplicate | TableError::NotFound(_))
            | NatError::NoSession(_) => BlockReason::Conflict,
            NatError::Edit(_) => BlockReason::Edit,
        }
    }
}

/// Which sessions a flush removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    All,
    /// TCP sessions being torn down
    ClosingTcp,
    /// Sessions idle for at least this many seconds
    IdleFor(u64),
    /// Sessions created by one rule
    Rule(RuleId),
}

/// A session created on behalf of an application proxy, typically for a data connection whose
/// source port is not known yet. Wild ports are filled by the first packet that matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildcardSpec {
    pub rule: RuleId,
    pub dir: NatDirection,
    pub orig: NatTuple,
    pub xlat: NatTuple,
    pub wild: WildPorts,
}

/// Both sides of the session a tuple belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NatLookup {
    pub id: SessionId,
    pub rule: RuleId,
    /// Direction of the initiating packet
    pub dir: NatDirection,
    pub orig: NatTuple,
    pub xlat: NatTuple,
}

/// Everything behind the state lock.
#[derive(Debug)]
pub(crate) struct NatState {
    pub(crate) rules: RuleStore,
    pub(crate) sessions: SessionTable,
    pub(crate) hostmaps: HostMapCache,
}

impl NatState {
    /// The session a flow travelling in `dir` belongs to: its original tuple when the session
    /// was initiated in `dir`, the reverse of its translated tuple when the flow is a reply.
    fn lookup(&self, dir: NatDirection, flow: &NatTuple) -> Option<(Arc<NatSession>, Role)> {
        if let Some(session) = self.sessions.lookup_by_original(dir, flow) {
            return Some((session.clone(), Role::Forward));
        }
        self.sessions
            .lookup_by_translated(dir.reverse(), &flow.reversed())
            .map(|session| (session.clone(), Role::Reply))
    }

    fn find_wildcard(&self, dir: NatDirection, flow: &NatTuple) -> Option<(Arc<NatSession>, Role)> {
        if let Some(session) = self.sessions.find_wildcard(TableSide::Original, dir, flow) {
            return Some((session.clone(), Role::Forward));
        }
        self.sessions
            .find_wildcard(TableSide::Translated, dir.reverse(), &flow.reversed())
            .map(|session| (session.clone(), Role::Reply))
    }

    /// Rules that would translate the first packet of `flow`, in evaluation order.
    fn matching(
        &self,
        dir: NatDirection,
        flow: &NatTuple,
        iface: Option<&str>,
        tables: &dyn AddrTables,
    ) -> Vec<Arc<NatRule>> {
        self.rules
            .candidates(dir, flow)
            .into_iter()
            .filter(|rule| rule.matches(flow, dir, iface, tables))
            .collect()
    }

    /// Unlink a session from both indices and forget its host map if no other session uses
    /// it. A packet of the session still in flight keeps the map until it is done.
    fn retire(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        debug!("Retired {session}");
        let map = session.hostmap().map(|map| HostMap::clone(map));
        drop(session);
        if let Some(map) = map {
            self.hostmaps.release(&map);
        }
        true
    }
}

pub struct NatEngine {
    config: NatConfig,
    state: RwLock<NatState>,
    create: Mutex<()>,
    queues: Mutex<TimeoutQueues>,
    frags: Mutex<FragCache>,
    policy: Mutex<CapacityPolicy>,
    stats: NatStats,
    now: AtomicU64,
    resolver: Arc<dyn InterfaceResolver>,
    tables: Arc<dyn AddrTables>,
}

impl std::fmt::Debug for NatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatEngine")
            .field("now", &self.now())
            .field("sessions", &self.state.read().sessions.len())
            .finish_non_exhaustive()
    }
}

impl NatEngine {
    /// Build an engine and load the rules of `config`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration or one of its rules is invalid.
    pub fn new(
        config: NatConfig,
        resolver: Arc<dyn InterfaceResolver>,
        tables: Arc<dyn AddrTables>,
    ) -> Result<Self, NatError> {
        config.validate()?;
        let state = NatState {
            rules: RuleStore::new(config.rule_hash_size),
            sessions: SessionTable::new(config.table_size, config.max_bucket, config.hash_seed),
            hostmaps: HostMapCache::new(config.hostmap_size),
        };
        let engine = Self {
            queues: Mutex::new(TimeoutQueues::new(&config)),
            frags: Mutex::new(FragCache::new(
                config.frag_max,
                config.ticks(config.frag_timeout_secs),
            )),
            policy: Mutex::new(CapacityPolicy::new(&config)),
            state: RwLock::new(state),
            create: Mutex::new(()),
            stats: NatStats::default(),
            now: AtomicU64::new(0),
            resolver,
            tables,
            config,
        };
        for spec in engine.config.rules.clone() {
            engine.add_rule(spec)?;
        }
        info!(
            "NAT engine ready: {} rules, at most {} sessions",
            engine.state.read().rules.len(),
            engine.config.table_max
        );
        Ok(engine)
    }

    /// An engine without interface addresses or address tables.
    ///
    /// # Errors
    ///
    /// Fails if the configuration or one of its rules is invalid.
    pub fn with_config(config: NatConfig) -> Result<Self, NatError> {
        Self::new(
            config,
            Arc::new(StaticInterfaces::new()),
            Arc::new(NamedTables::new()),
        )
    }

    #[must_use]
    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Current tick.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Advance the clock by one tick and age sessions and fragment trains. Returns the number of
    /// sessions expired.
    pub fn tick(&self) -> usize {
        self.advance(1)
    }

    /// Advance the clock by `ticks` at once.
    pub fn advance(&self, ticks: u64) -> usize {
        let now = self.now.fetch_add(ticks, Ordering::AcqRel) + ticks;
        let expired = self.expire(now);
        self.frags.lock().expire(now);
        expired
    }

    /// Remove every session due at `now`.
    fn expire(&self, now: u64) -> usize {
        let mut state = self.state.write();
        let mut queues = self.queues.lock();
        let mut expired = 0;
        for id in queues.take_expired(now) {
            if state.retire(id) {
                expired += 1;
            }
        }
        NatStats::add(&self.stats.expired, expired);
        expired
    }

    /// Translate a packet leaving the internal network.
    pub fn process_outbound(&self, packet: &mut Packet) -> NatVerdict {
        self.process(NatDirection::Outbound, packet)
    }

    /// Translate a packet entering the internal network.
    pub fn process_inbound(&self, packet: &mut Packet) -> NatVerdict {
        self.process(NatDirection::Inbound, packet)
    }

    fn process(&self, dir: NatDirection, packet: &mut Packet) -> NatVerdict {
        match self.translate_packet(dir, packet) {
            Ok(NatVerdict::Pass) => {
                NatStats::incr(&self.stats.passed);
                NatVerdict::Pass
            }
            Ok(verdict) => {
                NatStats::incr(&self.stats.translated);
                verdict
            }
            Err(e) => {
                let reason = e.block_reason();
                debug!("Blocking {dir} packet: {e}");
                packet.meta_mut().bad_nat = true;
                NatStats::incr(&self.stats.blocked);
                NatVerdict::Block(reason)
            }
        }
    }

    fn translate_packet(
        &self,
        dir: NatDirection,
        packet: &mut Packet,
    ) -> Result<NatVerdict, NatError> {
        if matches!(packet.transport(), Transport::IcmpError { .. }) {
            return self.icmp_error(dir, packet);
        }
        if packet.fragment().is_some_and(|f| !f.is_first()) {
            return self.fragment(dir, packet);
        }
        let Some(flow) = NatTuple::of_packet(packet) else {
            return Ok(NatVerdict::Pass);
        };
        let iface = packet.meta().iface.clone();
        let flags = packet.tcp_flags().unwrap_or_default();
        let Some((session, role)) = self.resolve(dir, &flow, iface.as_deref(), flags)? else {
            return Ok(NatVerdict::Pass);
        };
        self.apply(&session, role, dir, packet)?;
        Ok(NatVerdict::Translated)
    }

    /// Find or create the session of `flow`. `None` when no rule applies.
    fn resolve(
        &self,
        dir: NatDirection,
        flow: &NatTuple,
        iface: Option<&str>,
        flags: TcpFlags,
    ) -> Result<Option<(Arc<NatSession>, Role)>, NatError> {
        {
            let state = self.state.read();
            if let Some(hit) = state.lookup(dir, flow) {
                return Ok(Some(hit));
            }
            if state.find_wildcard(dir, flow).is_none() {
                // traffic no rule applies to never takes the creation path
                if state.matching(dir, flow, iface, &*self.tables).is_empty() {
                    return Ok(None);
                }
                drop(state);
                return self.create(dir, flow, iface, flags);
            }
        }
        match self.promote(dir, flow)? {
            Some(hit) => Ok(Some(hit)),
            None => self.create(dir, flow, iface, flags),
        }
    }

    /// Fill the ports of the wildcard session `flow` matches. The read lock was released by the
    /// caller, so the search is repeated under the write lock.
    fn promote(
        &self,
        dir: NatDirection,
        flow: &NatTuple,
    ) -> Result<Option<(Arc<NatSession>, Role)>, NatError> {
        let mut state = self.state.write();
        if let Some(hit) = state.lookup(dir, flow) {
            return Ok(Some(hit));
        }
        let Some((wild, role)) = state.find_wildcard(dir, flow) else {
            return Ok(None);
        };
        let concrete = match role {
            Role::Forward => *flow,
            Role::Reply => flow.reversed(),
        };
        let session = state.sessions.promote(wild.id(), &concrete)?;
        NatStats::incr(&self.stats.promoted);
        let state = RwLockWriteGuard::downgrade(state);
        debug!("Promoted {session}");
        Ok(state.lookup(dir, flow).or(Some((session, role))))
    }

    /// Create a session for the first packet of `flow`.
    fn create(
        &self,
        dir: NatDirection,
        flow: &NatTuple,
        iface: Option<&str>,
        flags: TcpFlags,
    ) -> Result<Option<(Arc<NatSession>, Role)>, NatError> {
        let _creating = self.create.lock();
        let mut state = self.state.write();
        // a racing first packet may have created it meanwhile
        if let Some(hit) = state.lookup(dir, flow) {
            return Ok(Some(hit));
        }
        // rules may have changed since the caller looked
        let candidates = state.matching(dir, flow, iface, &*self.tables);
        if candidates.is_empty() {
            return Ok(None);
        }

        let now = self.now();
        self.relieve_pressure(&mut state, now);
        let max = self.policy.lock().max();
        if state.sessions.len() >= max {
            NatStats::incr(&self.stats.table_max);
            warn!("Session table full ({max} sessions), not translating {flow}");
            return Err(NatError::TableMax(max));
        }

        let mut exhausted = false;
        for rule in candidates {
            let NatState {
                rules,
                sessions,
                hostmaps,
            } = &mut *state;
            let allocated = Allocator::new(
                sessions,
                hostmaps,
                &*self.resolver,
                self.config.alloc_search_limit,
            )
            .allocate(&rule, dir, flow, iface);
            let alloc = match allocated {
                Ok(alloc) => alloc,
                Err(AllocError::Exhausted) => {
                    NatStats::incr(&self.stats.exhausted);
                    warn!("Rule {} has no translation left for {flow}", rule.id());
                    exhausted = true;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let tuples = SessionTuples::new(*flow, alloc.xlat, WildPorts::empty());
            let session = self.insert_session(sessions, &rule, dir, tuples, alloc.hostmap, |s| {
                if flow.proto == NextHeader::TCP {
                    s.tcp.set(TcpState::initial(flags));
                }
            })?;
            rule.hit();
            if rule.flags().contains(RuleFlags::ROUND_ROBIN) {
                rules.rotate(&rule);
            }
            debug!("Created {session} after {} candidates", alloc.attempts);
            return Ok(Some((session, Role::Forward)));
        }
        if exhausted {
            return Err(AllocError::Exhausted.into());
        }
        Ok(None)
    }

    /// Link a new session into the table and its timeout queue. `setup` runs on the session
    /// before it is shared.
    fn insert_session(
        &self,
        sessions: &mut SessionTable,
        rule: &Arc<NatRule>,
        dir: NatDirection,
        tuples: SessionTuples,
        hostmap: Option<Arc<HostMap>>,
        setup: impl FnOnce(&mut NatSession),
    ) -> Result<Arc<NatSession>, NatError> {
        let now = self.now();
        let active = sessions.len();
        let inserted = sessions.insert(|id| {
            let mut session = NatSession::new(id, dir, rule.clone(), hostmap, tuples, now);
            setup(&mut session);
            session
        });
        let session = match inserted {
            Ok(session) => session,
            Err(e) => {
                match e {
                    TableError::BucketFull(TableSide::Original) => {
                        NatStats::incr(&self.stats.bucket_max_orig);
                    }
                    TableError::BucketFull(TableSide::Translated) => {
                        NatStats::incr(&self.stats.bucket_max_xlat);
                    }
                    TableError::AllocFailed => {
                        NatStats::incr(&self.stats.memfail);
                        self.policy.lock().on_alloc_failure(active);
                    }
                    TableError::TableFull => NatStats::incr(&self.stats.table_max),
                    TableError::Duplicate | TableError::NotFound(_) => {}
                }
                warn!("Could not insert a session of rule {}: {e}", rule.id());
                return Err(e.into());
            }
        };
        self.enqueue(&session, now);
        NatStats::incr(&self.stats.created);
        Ok(session)
    }

    /// Put a session at the tail of the queue matching its protocol state.
    fn enqueue(&self, session: &NatSession, now: u64) {
        let mut queues = self.queues.lock();
        // a session retired by a concurrent sweep must not come back
        if !session.is_live() {
            return;
        }
        let proto = session.tuples().orig.proto;
        let queue = queues.queue_for(
            proto,
            session.tcp_state(),
            &session.rule().timeouts(),
            self.config.tick_ms,
        );
        if let Some(expires) = queues.touch(session.id(), queue, now) {
            session.set_expires(expires);
        }
    }

    /// Unlink a session from the table and its queue. Lock order is state -> queues.
    fn drop_session(state: &mut NatState, queues: &mut TimeoutQueues, id: SessionId) -> bool {
        queues.remove(id);
        state.retire(id)
    }

    /// Above the high watermark, remove sessions until occupancy is below the low watermark:
    /// closing TCP sessions first, then sessions idle for decreasing lengths of time.
    fn relieve_pressure(&self, state: &mut NatState, now: u64) {
        let (flush, target) = {
            let mut policy = self.policy.lock();
            (
                policy.should_flush(state.sessions.len(), now),
                policy.low_target(),
            )
        };
        if !flush {
            return;
        }
        NatStats::incr(&self.stats.extra_flush);
        let mut queues = self.queues.lock();
        let before = state.sessions.len();
        let closing = [
            TcpState::Closed,
            TcpState::TimeWait,
            TcpState::Closing,
            TcpState::FinWait,
        ];
        for tcp in closing {
            for id in queues.members(QueueId::Tcp(tcp)) {
                if state.sessions.len() < target {
                    break;
                }
                Self::drop_session(state, &mut queues, id);
            }
        }
        for secs in IDLE_STEPS {
            if state.sessions.len() < target {
                break;
            }
            for id in queues.idle(self.config.ticks(secs), now) {
                if state.sessions.len() < target {
                    break;
                }
                Self::drop_session(state, &mut queues, id);
            }
        }
        let removed = before - state.sessions.len();
        NatStats::add(&self.stats.flushed, removed);
        warn!(
            "Session table above {}% of {}: flushed {removed} sessions",
            self.config.table_wm_high,
            self.policy.lock().max()
        );
    }
}
