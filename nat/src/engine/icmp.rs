// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! ICMP errors quoting a datagram of a session.
//!
//! The quoted datagram travelled in the opposite direction of the error. It is matched either
//! as a translated forward datagram (found by its translated tuple) or as a reply that was
//! already translated (found by the reverse of its tuple among original tuples). The quoted
//! header is restored to what its sender emitted and the error's own address is adjusted
//! wherever it named the translated endpoint.

use super::translate::{changed, checksum_context};
use super::{NatEngine, NatError, NatVerdict};
use crate::NatDirection;
use crate::rules::RuleKind;
use crate::session::NatTuple;
use crate::stats::NatStats;
use net::checksum::ChecksumDelta;
use net::packet::{DivertAction, EmbeddedEdit, EmbeddedTransport, Packet, Transport, Tunnel};

#[allow(unused)]
use tracing::{debug, warn};

/// How the quoted datagram was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoted {
    /// A forward datagram, after translation
    Forward,
    /// A reply datagram, after translation
    Reply,
}

struct Restore {
    quoted: NatTuple,
    restored: NatTuple,
    ip_delta: ChecksumDelta,
    l4_delta: ChecksumDelta,
}

fn embedded_edit(packet: &Packet, fix: &Restore, dir: NatDirection) -> EmbeddedEdit {
    let has_ports = matches!(
        packet.transport(),
        Transport::IcmpError { embedded, .. } if embedded.transport != EmbeddedTransport::Other
    );
    let Restore {
        quoted, restored, ..
    } = fix;
    let src = changed(quoted.src, restored.src);
    let dst = changed(quoted.dst, restored.dst);
    EmbeddedEdit {
        src,
        dst,
        src_port: has_ports.then(|| changed(quoted.sport, restored.sport)).flatten(),
        dst_port: has_ports.then(|| changed(quoted.dport, restored.dport)).flatten(),
        ip_delta: fix.ip_delta,
        l4_delta: fix.l4_delta,
        // the error goes back to the sender of the quoted datagram
        outer_dst: src.filter(|_| packet.dst_addr() == quoted.src),
        outer_src: dst.filter(|_| packet.src_addr() == quoted.dst),
        context: checksum_context(dir),
    }
}

impl NatEngine {
    pub(super) fn icmp_error(
        &self,
        dir: NatDirection,
        packet: &mut Packet,
    ) -> Result<NatVerdict, NatError> {
        let Some(quoted) = NatTuple::of_embedded(packet) else {
            return Ok(NatVerdict::Pass);
        };
        let found = {
            let state = self.state.read();
            state
                .sessions
                .lookup_by_translated(dir.reverse(), &quoted)
                .map(|s| (s.clone(), Quoted::Forward))
                .or_else(|| {
                    state
                        .sessions
                        .lookup_by_original(dir, &quoted.reversed())
                        .map(|s| (s.clone(), Quoted::Reply))
                })
        };
        let Some((session, how)) = found else {
            NatStats::incr(&self.stats.icmp_miss);
            debug!("No session for ICMP error quoting {quoted}");
            return Ok(NatVerdict::Pass);
        };
        let tuples = session.tuples();

        if session.kind() == RuleKind::Divert {
            if !session.rule().matches_encap_reply(&quoted) {
                NatStats::incr(&self.stats.icmp_miss);
                return Ok(NatVerdict::Pass);
            }
            let orig = tuples.orig;
            packet.meta_mut().divert = Some(DivertAction::TunnelError(Tunnel {
                src: orig.src,
                sport: orig.sport,
                dst: orig.dst,
                dport: orig.dport,
            }));
            NatStats::incr(&self.stats.icmp_translated);
            return Ok(NatVerdict::Translated);
        }

        let fix = match how {
            Quoted::Forward => Restore {
                quoted,
                restored: tuples.orig,
                ip_delta: tuples.ip_delta.negate(),
                l4_delta: tuples.l4_delta.negate(),
            },
            Quoted::Reply => Restore {
                quoted,
                restored: tuples.xlat.reversed(),
                ip_delta: tuples.ip_delta,
                l4_delta: tuples.l4_delta,
            },
        };
        let edit = embedded_edit(packet, &fix, dir);
        packet.translate_embedded(&edit)?;
        NatStats::incr(&self.stats.icmp_translated);
        debug!("ICMP error for {session}: quoted {quoted} restored to {}", fix.restored);
        Ok(NatVerdict::Translated)
    }
}
