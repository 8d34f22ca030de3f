// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NAT sessions: one live bidirectional mapping each.

pub mod table;
pub mod tcp;
pub mod timeout;

pub use table::{BucketStats, SessionTable, TableError, TableSide};
pub use tcp::{TcpState, TcpTracker};
pub use timeout::{QueueId, TimeoutQueues};

use crate::NatDirection;
use crate::alloc::hostmap::HostMap;
use crate::rules::{NatRule, RuleKind};
use arc_swap::ArcSwap;
use bitflags::bitflags;
use net::checksum::ChecksumDelta;
use net::ip::{IpFamily, NextHeader};
use net::packet::{EmbeddedTransport, Packet, Transport};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Protocol, addresses and ports of a flow. Flows without ports carry zeros; ICMP queries carry
/// their identifier as both ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatTuple {
    pub proto: NextHeader,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

impl NatTuple {
    #[must_use]
    pub fn new(proto: NextHeader, src: IpAddr, sport: u16, dst: IpAddr, dport: u16) -> Self {
        Self {
            proto,
            src,
            sport,
            dst,
            dport,
        }
    }

    /// The tuple of the same flow seen from the other end.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            proto: self.proto,
            src: self.dst,
            sport: self.dport,
            dst: self.src,
            dport: self.sport,
        }
    }

    /// The tuple of a datagram. ICMP errors have none, their flow is the quoted one.
    #[must_use]
    pub fn of_packet(packet: &Packet) -> Option<Self> {
        let (sport, dport) = match packet.transport() {
            Transport::IcmpError { .. } => return None,
            Transport::Other => (0, 0),
            _ => packet.ports()?,
        };
        Some(Self::new(
            packet.proto(),
            packet.src_addr(),
            sport,
            packet.dst_addr(),
            dport,
        ))
    }

    /// The tuple of the datagram quoted by an ICMP error.
    #[must_use]
    pub fn of_embedded(packet: &Packet) -> Option<Self> {
        let Transport::IcmpError { embedded, .. } = packet.transport() else {
            return None;
        };
        let (sport, dport) = match embedded.transport {
            EmbeddedTransport::Ports { sport, dport } => (sport, dport),
            EmbeddedTransport::IcmpQuery { id, .. } => (id, id),
            EmbeddedTransport::Other => (0, 0),
        };
        Some(Self::new(
            embedded.proto,
            embedded.src,
            sport,
            embedded.dst,
            dport,
        ))
    }

    /// Whether the ports are an ICMP query identifier.
    #[must_use]
    pub fn is_icmp_query(&self) -> bool {
        self.proto.is_icmp() && (self.sport != 0 || self.dport != 0)
    }

    #[must_use]
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.src)
    }

    /// The tuple with the ports in `wild` zeroed.
    #[must_use]
    pub fn masked(&self, wild: WildPorts) -> Self {
        let mut masked = *self;
        if wild.contains(WildPorts::SPORT) {
            masked.sport = 0;
        }
        if wild.contains(WildPorts::DPORT) {
            masked.dport = 0;
        }
        masked
    }
}

impl Display for NatTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (src, dst) = (self.src, self.dst);
        match (src, dst) {
            (IpAddr::V6(_), IpAddr::V6(_)) => write!(
                f,
                "{} [{src}]:{} -> [{dst}]:{}",
                self.proto, self.sport, self.dport
            ),
            _ => write!(
                f,
                "{} {src}:{} -> {dst}:{}",
                self.proto, self.sport, self.dport
            ),
        }
    }
}

/// Stable handle of a session: its slot and the generation of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub index: u32,
    pub generation: u32,
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

bitflags! {
    /// Ports of the original tuple not known yet.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WildPorts: u8 {
        const SPORT = 1 << 0;
        const DPORT = 1 << 1;
    }
}

/// Both tuples of a session plus what is derived from them. Replaced as a whole when a wildcard
/// session is promoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTuples {
    /// The flow as sent by the initiator
    pub orig: NatTuple,
    /// The same flow after translation
    pub xlat: NatTuple,
    pub wild: WildPorts,
    /// Delta of the IPv4 header checksum from `orig` to `xlat`
    pub ip_delta: ChecksumDelta,
    /// Delta of the transport checksum from `orig` to `xlat`
    pub l4_delta: ChecksumDelta,
}

impl SessionTuples {
    #[must_use]
    pub fn new(orig: NatTuple, xlat: NatTuple, wild: WildPorts) -> Self {
        let ip_delta = ChecksumDelta::from_addrs(orig.src, xlat.src)
            .combine(ChecksumDelta::from_addrs(orig.dst, xlat.dst));
        let l4_delta = match orig.proto {
            NextHeader::TCP | NextHeader::UDP => ip_delta
                .combine(ChecksumDelta::from_port(orig.sport, xlat.sport))
                .combine(ChecksumDelta::from_port(orig.dport, xlat.dport)),
            // the identifier appears once in the header; only ICMPv6 has a pseudo-header
            NextHeader::ICMP => ChecksumDelta::from_port(orig.sport, xlat.sport),
            NextHeader::ICMP6 => ip_delta.combine(ChecksumDelta::from_port(orig.sport, xlat.sport)),
            _ => ChecksumDelta::NONE,
        };
        Self {
            orig,
            xlat,
            wild,
            ip_delta,
            l4_delta,
        }
    }

    /// Fill the wildcard ports from a concrete flow, which must agree on everything else.
    #[must_use]
    pub fn promoted(&self, flow: &NatTuple) -> Self {
        let mut orig = self.orig;
        let mut xlat = self.xlat;
        if self.wild.contains(WildPorts::SPORT) {
            orig.sport = flow.sport;
            xlat.sport = flow.sport;
        }
        if self.wild.contains(WildPorts::DPORT) {
            orig.dport = flow.dport;
            xlat.dport = flow.dport;
        }
        Self::new(orig, xlat, WildPorts::empty())
    }

    #[must_use]
    pub fn is_wild(&self) -> bool {
        !self.wild.is_empty()
    }
}

/// Per-direction traffic counters.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl SessionCounters {
    pub fn count(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(u64::try_from(bytes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn read(&self) -> (u64, u64) {
        (
            self.packets.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// One live mapping. Shared as `Arc<NatSession>` by the table, in-flight packets and observers;
/// the rule is released when the last reference goes away.
#[derive(Debug)]
pub struct NatSession {
    id: SessionId,
    kind: RuleKind,
    dir: NatDirection,
    rule: Arc<NatRule>,
    hostmap: Option<Arc<HostMap>>,
    proxy: Option<Arc<str>>,
    tuples: ArcSwap<SessionTuples>,
    pub(crate) tcp: TcpTracker,
    expires: AtomicU64,
    created: u64,
    live: AtomicBool,
    /// Traffic in the initiating direction
    pub forward: SessionCounters,
    /// Traffic in the other direction
    pub reply: SessionCounters,
}

impl NatSession {
    pub(crate) fn new(
        id: SessionId,
        dir: NatDirection,
        rule: Arc<NatRule>,
        hostmap: Option<Arc<HostMap>>,
        tuples: SessionTuples,
        now: u64,
    ) -> Self {
        rule.acquire();
        Self {
            id,
            kind: rule.kind(),
            dir,
            proxy: rule.proxy().map(Arc::from),
            rule,
            hostmap,
            tuples: ArcSwap::from_pointee(tuples),
            tcp: TcpTracker::default(),
            expires: AtomicU64::new(now),
            created: now,
            live: AtomicBool::new(true),
            forward: SessionCounters::default(),
            reply: SessionCounters::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Direction the initiating packet travelled.
    #[must_use]
    pub fn dir(&self) -> NatDirection {
        self.dir
    }

    #[must_use]
    pub fn rule(&self) -> &Arc<NatRule> {
        &self.rule
    }

    #[must_use]
    pub fn hostmap(&self) -> Option<&Arc<HostMap>> {
        self.hostmap.as_ref()
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub(crate) fn set_proxy(&mut self, proxy: Option<&str>) {
        self.proxy = proxy.map(Arc::from);
    }

    #[must_use]
    pub fn tuples(&self) -> Arc<SessionTuples> {
        self.tuples.load_full()
    }

    pub(crate) fn set_tuples(&self, tuples: SessionTuples) {
        self.tuples.store(Arc::new(tuples));
    }

    #[must_use]
    pub fn tcp_state(&self) -> TcpState {
        self.tcp.state()
    }

    /// Tick at which the session expires unless touched.
    #[must_use]
    pub fn expires(&self) -> u64 {
        self.expires.load(Ordering::Acquire)
    }

    pub(crate) fn set_expires(&self, tick: u64) {
        self.expires.store(tick, Ordering::Release);
    }

    #[must_use]
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Whether the session is still in the table.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl Drop for NatSession {
    fn drop(&mut self) {
        self.rule.release();
    }
}

impl Display for NatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tuples = self.tuples();
        write!(
            f,
            "session {} {} {} rule {}: {} => {}",
            self.id, self.kind, self.dir, self.rule.id(), tuples.orig, tuples.xlat
        )?;
        if tuples.is_wild() {
            write!(f, " (wild)")?;
        }
        if tuples.orig.proto == NextHeader::TCP {
            write!(f, " {}", self.tcp_state())?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn tuple_reverse_and_mask() {
        let t = NatTuple::new(NextHeader::TCP, addr("10.0.0.5"), 4000, addr("93.184.1.1"), 80);
        assert_eq!(t.reversed().reversed(), t);
        assert_eq!(t.reversed().src, addr("93.184.1.1"));
        assert_eq!(t.masked(WildPorts::SPORT).sport, 0);
        assert_eq!(t.masked(WildPorts::all()).dport, 0);
        assert_eq!(t.to_string(), "tcp 10.0.0.5:4000 -> 93.184.1.1:80");
    }

    #[test]
    fn icmp_query_delta_counts_identifier_once() {
        let orig = NatTuple::new(NextHeader::ICMP, addr("10.0.0.5"), 7, addr("8.8.8.8"), 7);
        let xlat = NatTuple::new(NextHeader::ICMP, addr("203.0.113.5"), 9, addr("8.8.8.8"), 9);
        let tuples = SessionTuples::new(orig, xlat, WildPorts::empty());
        assert_eq!(tuples.l4_delta, ChecksumDelta::from_port(7, 9));
    }

    #[test]
    fn promotion_fills_wild_ports_on_both_sides() {
        let orig = NatTuple::new(NextHeader::TCP, addr("10.0.0.5"), 0, addr("93.184.1.1"), 20);
        let xlat = NatTuple::new(NextHeader::TCP, addr("203.0.113.5"), 0, addr("93.184.1.1"), 20);
        let wild = SessionTuples::new(orig, xlat, WildPorts::SPORT);
        let flow = NatTuple { sport: 3333, ..orig };
        let promoted = wild.promoted(&flow);
        assert!(!promoted.is_wild());
        assert_eq!(promoted.orig.sport, 3333);
        assert_eq!(promoted.xlat.sport, 3333);
        assert_eq!(promoted.orig.dport, 20);
    }
}
