// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane operations: rules, flushing, inspection and session sync.

use super::{FlushMode, NatEngine, NatError, NatLookup, NatState, WildcardSpec};
use crate::NatDirection;
use crate::alloc::hostmap::HostMap;
use crate::rules::{NatRule, NatRuleSpec, RuleError, RuleFlags, RuleId};
use crate::session::{NatSession, NatTuple, SessionId, SessionTuples, TimeoutQueues};
use crate::stats::{NatStats, NatStatsSnapshot};
use crate::sync::{SessionRecord, SyncError};
use crate::walk::{self, SessionInfo, WalkKind, WalkPage, WalkToken};
use net::ip::NextHeader;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[allow(unused)]
use tracing::{debug, info, warn};

impl NatEngine {
    /// Validate a rule and make it live.
    ///
    /// # Errors
    ///
    /// Returns the `RuleError` rejecting the spec.
    pub fn add_rule(&self, spec: NatRuleSpec) -> Result<RuleId, NatError> {
        let rule = self.state.write().rules.add_rule(spec)?;
        Ok(rule.id())
    }

    /// Remove a rule. Its sessions keep it alive unless it carries the `PURGE` flag, in which
    /// case they are flushed. Returns the number of sessions flushed.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` if there is no such rule.
    pub fn remove_rule(&self, id: RuleId) -> Result<usize, NatError> {
        let mut state = self.state.write();
        let rule = state.rules.remove_rule(id)?;
        state.hostmaps.remove_rule(id);
        if !rule.flags().contains(RuleFlags::PURGE) {
            return Ok(0);
        }
        let mut queues = self.queues.lock();
        let flushed = Self::flush_locked(&mut state, &mut queues, |s| s.rule().id() == id);
        NatStats::add(&self.stats.flushed, flushed);
        info!("Purged {flushed} sessions of rule {id}");
        Ok(flushed)
    }

    /// Declare an application proxy rules may refer to. Returns false if it was known already.
    pub fn register_proxy(&self, name: &str) -> bool {
        self.state.write().rules.register_proxy(name)
    }

    /// Remove sessions. Returns how many were removed.
    pub fn flush(&self, mode: FlushMode) -> usize {
        let now = self.now();
        let mut state = self.state.write();
        let mut queues = self.queues.lock();
        let flushed = match mode {
            FlushMode::All => Self::flush_locked(&mut state, &mut queues, |_| true),
            FlushMode::ClosingTcp => Self::flush_locked(&mut state, &mut queues, |s| {
                s.tuples().orig.proto == NextHeader::TCP && s.tcp_state().is_closing()
            }),
            FlushMode::Rule(id) => {
                Self::flush_locked(&mut state, &mut queues, |s| s.rule().id() == id)
            }
            FlushMode::IdleFor(secs) => {
                let idle = queues.idle(self.config.ticks(secs), now);
                idle.into_iter()
                    .filter(|id| Self::drop_session(&mut state, &mut queues, *id))
                    .count()
            }
        };
        NatStats::add(&self.stats.flushed, flushed);
        info!("Flush {mode:?} removed {flushed} sessions");
        flushed
    }

    fn flush_locked(
        state: &mut NatState,
        queues: &mut TimeoutQueues,
        select: impl Fn(&NatSession) -> bool,
    ) -> usize {
        let doomed: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|s| select(s))
            .map(|s| s.id())
            .collect();
        doomed
            .into_iter()
            .filter(|id| Self::drop_session(state, queues, *id))
            .count()
    }

    /// Statistics of the engine.
    #[must_use]
    pub fn stats(&self) -> NatStatsSnapshot {
        let (sessions, rules, hostmaps, buckets) = {
            let state = self.state.read();
            (
                state.sessions.len(),
                state.rules.len(),
                state.hostmaps.len(),
                state.sessions.stats(),
            )
        };
        let queues = self.queues.lock().stats();
        NatStatsSnapshot {
            counters: self.stats.read(),
            sessions,
            table_max: self.policy.lock().max(),
            rules,
            hostmaps,
            fragments: self.frags.lock().len(),
            now: self.now(),
            buckets,
            queues,
        }
    }

    /// The session `flow`, seen travelling in `dir`, belongs to, with both of its tuples.
    #[must_use]
    pub fn lookup_redirect(&self, dir: NatDirection, flow: &NatTuple) -> Option<NatLookup> {
        let state = self.state.read();
        let (session, _) = state.lookup(dir, flow)?;
        let tuples = session.tuples();
        Some(NatLookup {
            id: session.id(),
            rule: session.rule().id(),
            dir: session.dir(),
            orig: tuples.orig,
            xlat: tuples.xlat,
        })
    }

    /// One session, for inspection.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        let state = self.state.read();
        state.sessions.get(id).map(|s| SessionInfo::of_session(s))
    }

    /// A page of at most `limit` items of `kind`, starting where `token` points. A token of
    /// another kind restarts the walk.
    #[must_use]
    pub fn walk(&self, kind: WalkKind, token: Option<WalkToken>, limit: usize) -> WalkPage {
        let from = token
            .filter(|t| t.kind == kind)
            .map_or(0, |t| t.position);
        let state = self.state.read();
        match kind {
            WalkKind::Rules => walk::rules(&state.rules, from, limit),
            WalkKind::Sessions => walk::sessions(&state.sessions, from, limit),
            WalkKind::HostMaps => walk::hostmaps(&state.hostmaps, from, limit),
        }
    }

    /// Create a session ahead of its traffic, with the ports in `spec.wild` left open. The
    /// first packet matching the other fields fills them.
    ///
    /// # Errors
    ///
    /// Fails if the rule is unknown, the tuples clash with a session or the table is full.
    pub fn add_wildcard_session(&self, spec: WildcardSpec) -> Result<SessionId, NatError> {
        let _creating = self.create.lock();
        let mut state = self.state.write();
        let rule = state
            .rules
            .get(spec.rule)
            .cloned()
            .ok_or(RuleError::NotFound(spec.rule))?;
        let max = self.policy.lock().max();
        if state.sessions.len() >= max {
            NatStats::incr(&self.stats.table_max);
            return Err(NatError::TableMax(max));
        }
        let tuples = SessionTuples::new(
            spec.orig.masked(spec.wild),
            spec.xlat.masked(spec.wild),
            spec.wild,
        );
        let session =
            self.insert_session(&mut state.sessions, &rule, spec.dir, tuples, None, |_| {})?;
        info!("Added wildcard session {session}");
        Ok(session.id())
    }

    /// A record from which another engine can re-create a session.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` if there is no such session.
    pub fn export_session(&self, id: SessionId) -> Result<SessionRecord, SyncError> {
        let state = self.state.read();
        let session = state.sessions.get(id).ok_or(SyncError::NotFound(id))?;
        Ok(SessionRecord::of_session(session))
    }

    /// Re-create an exported session, and its rule if no identical rule is present. The session
    /// gets a fresh timeout.
    ///
    /// # Errors
    ///
    /// Fails if the record is inconsistent, its tuples clash with an existing session or the
    /// rule cannot be created.
    pub fn import_session(&self, record: SessionRecord) -> Result<SessionId, SyncError> {
        record.check()?;
        let _creating = self.create.lock();
        let mut state = self.state.write();

        let clash = state
            .sessions
            .lookup_by_original(record.dir, &record.orig)
            .is_some()
            || state
                .sessions
                .lookup_by_translated(record.dir, &record.xlat)
                .is_some()
            || (record.wild.is_empty() && state.sessions.collides(record.dir, &record.xlat));
        if clash {
            return Err(SyncError::Duplicate(record.orig));
        }

        let rule = Self::rule_for(&mut state, &record.rule)?;
        let hostmap = record.hostmap.clone().map(|map| {
            state.hostmaps.insert(HostMap {
                rule: rule.id(),
                ..map
            })
        });
        let tuples = SessionTuples::new(record.orig, record.xlat, record.wild);
        let session = self
            .insert_session(
                &mut state.sessions,
                &rule,
                record.dir,
                tuples,
                hostmap,
                |s| {
                    s.tcp.set(record.tcp_state);
                    s.set_proxy(record.proxy.as_deref());
                },
            )
            .map_err(|e| match e {
                NatError::Table(e) => SyncError::Table(e),
                _ => SyncError::Invalid("session could not be inserted"),
            })?;
        session
            .forward
            .packets
            .store(record.forward.packets, Ordering::Relaxed);
        session
            .forward
            .bytes
            .store(record.forward.bytes, Ordering::Relaxed);
        session
            .reply
            .packets
            .store(record.reply.packets, Ordering::Relaxed);
        session.reply.bytes.store(record.reply.bytes, Ordering::Relaxed);
        NatStats::incr(&self.stats.imported);
        debug!("Imported {session}");
        Ok(session.id())
    }

    /// The live rule an imported session belongs to: an identical one, one with the same name,
    /// or a new one built from the record.
    fn rule_for(state: &mut NatState, spec: &NatRuleSpec) -> Result<Arc<NatRule>, SyncError> {
        if let Some(rule) = state.rules.find_by_spec(spec) {
            return Ok(rule.clone());
        }
        if let Some(name) = &spec.name
            && let Some(rule) = state.rules.find_by_name(name)
        {
            return Ok(rule.clone());
        }
        if let Some(proxy) = &spec.proxy {
            state.rules.register_proxy(proxy);
        }
        Ok(state.rules.add_rule(spec.clone())?)
    }
}
