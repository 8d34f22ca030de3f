// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rewriting the datagrams of a known session.

use super::{NatEngine, NatError, NatVerdict};
use crate::NatDirection;
use crate::frag::{FragKey, Role};
use crate::rules::RuleKind;
use crate::session::{NatSession, NatTuple, SessionTuples};
use crate::stats::NatStats;
use net::packet::{ChecksumContext, DivertAction, Packet, Translation, Tunnel};
use std::sync::Arc;

#[allow(unused)]
use tracing::{debug, warn};

pub(super) fn checksum_context(dir: NatDirection) -> ChecksumContext {
    match dir {
        NatDirection::Outbound => ChecksumContext::Outbound,
        NatDirection::Inbound => ChecksumContext::Inbound,
    }
}

pub(super) fn changed<T: PartialEq>(old: T, new: T) -> Option<T> {
    (old != new).then_some(new)
}

fn tunnel(flow: &NatTuple) -> Tunnel {
    Tunnel {
        src: flow.src,
        sport: flow.sport,
        dst: flow.dst,
        dport: flow.dport,
    }
}

/// The edit turning a datagram of the session into its translated form. Forward datagrams go
/// from the original tuple to the translated one, replies the other way round.
fn rewrite(tuples: &SessionTuples, role: Role, dir: NatDirection, has_ports: bool) -> Translation {
    let (from, to, ip_delta, l4_delta) = match role {
        Role::Forward => (tuples.orig, tuples.xlat, tuples.ip_delta, tuples.l4_delta),
        Role::Reply => (
            tuples.xlat.reversed(),
            tuples.orig.reversed(),
            tuples.ip_delta.negate(),
            tuples.l4_delta.negate(),
        ),
    };
    Translation {
        src: changed(from.src, to.src),
        dst: changed(from.dst, to.dst),
        src_port: has_ports.then(|| changed(from.sport, to.sport)).flatten(),
        dst_port: has_ports.then(|| changed(from.dport, to.dport)).flatten(),
        ip_delta,
        l4_delta,
        context: checksum_context(dir),
    }
}

/// What the encapsulation layer has to do for a datagram of a divert session.
fn divert_action(tuples: &SessionTuples, role: Role) -> DivertAction {
    match role {
        Role::Forward => DivertAction::Encapsulate(tunnel(&tuples.xlat)),
        Role::Reply => DivertAction::Decapsulate(tunnel(&tuples.orig.reversed())),
    }
}

impl NatEngine {
    /// Translate a datagram of `session` travelling in `dir`, then account it: counters, TCP
    /// state, fragment train and timeout.
    pub(super) fn apply(
        &self,
        session: &Arc<NatSession>,
        role: Role,
        dir: NatDirection,
        packet: &mut Packet,
    ) -> Result<(), NatError> {
        let now = self.now();
        let tuples = session.tuples();
        // keyed on the untranslated header, as the following fragments arrive
        let train = packet
            .fragment()
            .filter(|f| f.is_first() && f.more)
            .and_then(|_| FragKey::of(packet));

        if session.kind() == RuleKind::Divert {
            packet.meta_mut().divert = Some(divert_action(&tuples, role));
        } else {
            let edit = rewrite(&tuples, role, dir, packet.ports().is_some());
            packet.translate(&edit)?;
        }

        match role {
            Role::Forward => session.forward.count(packet.len()),
            Role::Reply => session.reply.count(packet.len()),
        }
        if let Some(flags) = packet.tcp_flags() {
            let (before, after) = session.tcp.observe(flags, role == Role::Forward);
            if before != after {
                debug!("Session {}: TCP {before} -> {after}", session.id());
            }
        }
        if let Some(key) = train
            && !self.frags.lock().insert(key, session, role, now)
        {
            NatStats::incr(&self.stats.frag_full);
            debug!("Session {}: following fragments of {key:?} will pass", session.id());
        }
        self.enqueue(session, now);
        Ok(())
    }

    /// A non-first fragment carries no ports; it follows the session of its first fragment.
    pub(super) fn fragment(
        &self,
        dir: NatDirection,
        packet: &mut Packet,
    ) -> Result<NatVerdict, NatError> {
        let Some(key) = FragKey::of(packet) else {
            return Ok(NatVerdict::Pass);
        };
        let found = self.frags.lock().lookup(&key, self.now());
        let Some((session, role)) = found else {
            NatStats::incr(&self.stats.frag_miss);
            debug!("No train for fragment {key:?}");
            return Ok(NatVerdict::Pass);
        };
        NatStats::incr(&self.stats.frag_hit);
        self.apply(&session, role, dir, packet)?;
        Ok(NatVerdict::Translated)
    }
}
