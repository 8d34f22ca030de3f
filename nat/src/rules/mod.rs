// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Translation rules.
//!
//! A [`NatRuleSpec`] is the serde form of a rule, as found in the configuration. Adding it to the
//! [`RuleStore`] validates it and produces a [`NatRule`], which carries the resolved pool and the
//! counters mutated on every session creation.

mod display;
mod store;


pub use store::RuleStore;

use crate::NatDirection;
use crate::lookup::AddrTables;
use crate::ranges::{IpRange, PortRange, RangeError};
use crate::session::NatTuple;
use bitflags::bitflags;
use ipnet::IpNet;
use net::ip::{IpFamily, NextHeader};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum RuleError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("address families of the rule do not agree")]
    FamilyMismatch,
    #[error("{0} rules need a plain source network")]
    NeedsSourceNet(RuleKind),
    #[error("bimap networks differ in size: {0} vs {1}")]
    BimapSizeMismatch(IpNet, IpNet),
    #[error("pool {0} is not usable by {1} rules")]
    InvalidPool(String, RuleKind),
    #[error("divert rules need tunnel endpoints")]
    MissingDivert,
    #[error("flag {0} is inconsistent with the rule")]
    InvalidFlag(&'static str),
    #[error("unknown proxy {0}")]
    UnknownProxy(String),
    #[error("no rule with id {0}")]
    NotFound(RuleId),
    #[error("a rule named {0} already exists")]
    DuplicateName(String),
}

/// Identifier assigned to a rule when it enters the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

impl Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleKind {
    /// Outbound source translation
    #[default]
    Map,
    /// Inbound destination translation
    Redirect,
    /// Static 1:1 translation between two networks of the same size, both directions
    Bimap,
    /// Arithmetic source translation: every original address owns a block of ports
    MapBlock,
    /// Encapsulation towards a remote endpoint, performed by an external layer
    Divert,
}

/// An address predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrMatch {
    #[default]
    Any,
    Net {
        net: IpNet,
        #[serde(default)]
        not: bool,
    },
    /// Membership in a named external table
    Table {
        name: String,
        #[serde(default)]
        not: bool,
    },
}

impl AddrMatch {
    #[must_use]
    pub fn net(net: IpNet) -> Self {
        AddrMatch::Net { net, not: false }
    }

    fn matches(&self, addr: IpAddr, tables: &dyn AddrTables) -> bool {
        match self {
            AddrMatch::Any => true,
            AddrMatch::Net { net, not } => net.contains(&addr) != *not,
            AddrMatch::Table { name, not } => tables.contains(name, addr) != *not,
        }
    }

    /// The network the rule hashes under, when the predicate is a plain network.
    pub(crate) fn plain_net(&self) -> Option<IpNet> {
        match self {
            AddrMatch::Net { net, not: false } => Some(net.trunc()),
            _ => None,
        }
    }

    fn family(&self) -> Option<IpFamily> {
        match self {
            AddrMatch::Net { net, .. } => Some(IpFamily::of(&net.addr())),
            _ => None,
        }
    }
}

/// Where translated addresses come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSpec {
    Addr(IpAddr),
    /// A prefix. `0.0.0.0/32` (or `::/128`) means the interface address, `0/0` keeps the address.
    Cidr(IpNet),
    Range { start: IpAddr, end: IpAddr },
    /// Two addresses used alternately
    Split(IpAddr, IpAddr),
    #[default]
    Interface,
    Identity,
}

/// How translated ports are chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortMode {
    /// Keep the original port
    Fixed,
    /// Walk the port range from the rule cursor
    #[default]
    Sequential,
    /// Start from a random point of the port range
    Random,
    /// Give every original address its own slice of the port space
    Auto,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RuleFlags: u16 {
        /// Rotate the rule behind its bucket peers after each new session
        const ROUND_ROBIN = 1 << 0;
        /// Reuse the address chosen for a host pair
        const STICKY      = 1 << 1;
        /// Alternate between the two addresses of a split pool
        const SPLIT       = 1 << 2;
        /// The pool is an explicit address range
        const IPRANGE     = 1 << 3;
        /// Never change the source port
        const FIXED_SPORT = 1 << 4;
        /// Never change the destination port
        const FIXED_DPORT = 1 << 5;
        /// Flush the sessions of the rule when it is removed
        const PURGE       = 1 << 6;
    }
}

/// Per-rule idle timeouts in seconds, overriding the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleTimeouts {
    pub tcp_established: Option<u64>,
    pub udp: Option<u64>,
    pub icmp: Option<u64>,
    pub ip: Option<u64>,
}

impl RuleTimeouts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == RuleTimeouts::default()
    }
}

/// Tunnel endpoints of a divert rule. Translated flows become UDP from `local` (port from the
/// rule's port range) to `remote:dport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DivertSpec {
    pub local: IpAddr,
    pub remote: IpAddr,
    pub dport: u16,
}

/// The configured form of a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatRuleSpec {
    pub name: Option<String>,
    pub kind: RuleKind,
    /// Only packets seen on this interface match
    pub interface: Option<String>,
    pub proto: Option<NextHeader>,
    pub src: AddrMatch,
    pub dst: AddrMatch,
    pub sports: Option<PortRange>,
    pub dports: Option<PortRange>,
    pub pool: PoolSpec,
    /// Translated ports
    pub ports: Option<PortRange>,
    pub port_mode: PortMode,
    pub flags: RuleFlags,
    pub timeouts: RuleTimeouts,
    pub proxy: Option<String>,
    pub divert: Option<DivertSpec>,
}

impl NatRuleSpec {
    /// Source translation of `src` to `pool`.
    #[must_use]
    pub fn map(src: IpNet, pool: PoolSpec) -> Self {
        Self {
            kind: RuleKind::Map,
            src: AddrMatch::net(src),
            pool,
            ..Default::default()
        }
    }

    /// Destination translation of `dst` to `pool`.
    #[must_use]
    pub fn redirect(dst: IpNet, pool: PoolSpec) -> Self {
        Self {
            kind: RuleKind::Redirect,
            dst: AddrMatch::net(dst),
            pool,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn with_proto(mut self, proto: NextHeader) -> Self {
        self.proto = Some(proto);
        self
    }

    #[must_use]
    pub fn with_ports(mut self, ports: PortRange, mode: PortMode) -> Self {
        self.ports = Some(ports);
        self.port_mode = mode;
        self
    }

    #[must_use]
    pub fn with_dports(mut self, dports: PortRange) -> Self {
        self.dports = Some(dports);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: RuleFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// A pool after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Range(IpRange),
    Split(IpAddr, IpAddr),
    Interface,
    Identity,
}

impl Pool {
    fn resolve(spec: &PoolSpec, skip_edges: bool) -> Result<Self, RuleError> {
        Ok(match spec {
            PoolSpec::Addr(addr) => Pool::Range(IpRange::single(*addr)),
            PoolSpec::Cidr(net)
                if net.addr().is_unspecified() && net.prefix_len() == net.max_prefix_len() =>
            {
                Pool::Interface
            }
            PoolSpec::Cidr(net) if net.addr().is_unspecified() && net.prefix_len() == 0 => {
                Pool::Identity
            }
            PoolSpec::Cidr(net) => Pool::Range(IpRange::from_net(*net, skip_edges)),
            PoolSpec::Range { start, end } => Pool::Range(IpRange::new(*start, *end)?),
            PoolSpec::Split(a, b) => {
                if a.is_ipv4() != b.is_ipv4() {
                    return Err(RuleError::FamilyMismatch);
                }
                Pool::Split(*a, *b)
            }
            PoolSpec::Interface => Pool::Interface,
            PoolSpec::Identity => Pool::Identity,
        })
    }

    #[must_use]
    pub fn family(&self) -> Option<IpFamily> {
        match self {
            Pool::Range(range) => Some(range.family()),
            Pool::Split(a, _) => Some(IpFamily::of(a)),
            Pool::Interface | Pool::Identity => None,
        }
    }

    /// Number of addresses, the interface and identity pools counting as one.
    #[must_use]
    pub fn addresses(&self) -> u128 {
        match self {
            Pool::Range(range) => range.len(),
            Pool::Split(..) => 2,
            Pool::Interface | Pool::Identity => 1,
        }
    }
}

/// The rotating allocation state of a rule.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCursor {
    /// Next offset into the address x port space
    pub offset: u128,
    /// Which half of a split pool comes next
    pub second: bool,
}

/// Prefix pair of bimap and map-block rules: the original network and the pool network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetPair {
    pub orig: IpNet,
    pub pool: IpNet,
}

fn pool_net(spec: &PoolSpec) -> Option<IpNet> {
    match spec {
        PoolSpec::Addr(addr) => IpNet::new(*addr, IpFamily::of(addr).bits()).ok(),
        PoolSpec::Cidr(net) if !net.addr().is_unspecified() => Some(net.trunc()),
        _ => None,
    }
}

/// A validated rule, shared by the store and the sessions it created.
#[derive(Debug)]
pub struct NatRule {
    id: RuleId,
    spec: NatRuleSpec,
    pool: Pool,
    nets: Option<NetPair>,
    family: Option<IpFamily>,
    pool_size: u64,
    use_count: AtomicU32,
    hits: AtomicU64,
    deleted: AtomicBool,
    cursor: Mutex<PoolCursor>,
}

impl NatRule {
    /// Validate a spec into a rule.
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the spec is inconsistent.
    pub fn new(id: RuleId, mut spec: NatRuleSpec) -> Result<Self, RuleError> {
        let skip_edges = matches!(
            spec.kind,
            RuleKind::Map | RuleKind::Redirect | RuleKind::Divert
        );
        let pool = Pool::resolve(&spec.pool, skip_edges)?;
        if matches!(spec.pool, PoolSpec::Range { .. }) {
            spec.flags |= RuleFlags::IPRANGE;
        } else if spec.flags.contains(RuleFlags::IPRANGE) {
            return Err(RuleError::InvalidFlag("IPRANGE"));
        }
        if matches!(pool, Pool::Split(..)) {
            spec.flags |= RuleFlags::SPLIT;
        } else if spec.flags.contains(RuleFlags::SPLIT) {
            return Err(RuleError::InvalidFlag("SPLIT"));
        }

        let families = [spec.src.family(), spec.dst.family(), pool.family()];
        let mut family = None;
        for f in families.into_iter().flatten() {
            if family.is_some_and(|known| known != f) {
                return Err(RuleError::FamilyMismatch);
            }
            family = Some(f);
        }

        let nets = match spec.kind {
            RuleKind::Bimap | RuleKind::MapBlock => {
                let orig = spec
                    .src
                    .plain_net()
                    .ok_or(RuleError::NeedsSourceNet(spec.kind))?;
                let pool = pool_net(&spec.pool)
                    .ok_or_else(|| RuleError::InvalidPool(format!("{:?}", spec.pool), spec.kind))?;
                if spec.kind == RuleKind::Bimap && orig.prefix_len() != pool.prefix_len() {
                    return Err(RuleError::BimapSizeMismatch(orig, pool));
                }
                Some(NetPair { orig, pool })
            }
            _ => None,
        };
        if spec.kind == RuleKind::Redirect && matches!(pool, Pool::Identity) && spec.ports.is_none()
        {
            return Err(RuleError::InvalidPool("identity".to_string(), spec.kind));
        }
        if let Some(divert) = &spec.divert {
            if divert.local.is_ipv4() != divert.remote.is_ipv4() {
                return Err(RuleError::FamilyMismatch);
            }
        } else if spec.kind == RuleKind::Divert {
            return Err(RuleError::MissingDivert);
        }

        let mut rule = Self {
            id,
            spec,
            pool,
            nets,
            family,
            pool_size: 0,
            use_count: AtomicU32::new(0),
            hits: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
            cursor: Mutex::new(PoolCursor::default()),
        };
        rule.pool_size = rule.compute_pool_size();
        Ok(rule)
    }

    fn compute_pool_size(&self) -> u64 {
        let addresses = match (self.spec.kind, self.nets) {
            (RuleKind::Bimap | RuleKind::MapBlock, Some(nets)) => {
                IpRange::from_net(nets.pool, false).len()
            }
            _ => self.pool.addresses(),
        };
        let ports = self
            .xlat_ports()
            .map_or(1, |ports| u128::from(ports.len()));
        let protocols = if self.spec.proto.is_none() { 3 } else { 1 };
        let size = addresses.saturating_mul(ports).saturating_mul(protocols);
        u64::try_from(size).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn id(&self) -> RuleId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.spec.name.as_deref()
    }

    #[must_use]
    pub fn spec(&self) -> &NatRuleSpec {
        &self.spec
    }

    #[must_use]
    pub fn kind(&self) -> RuleKind {
        self.spec.kind
    }

    #[must_use]
    pub fn flags(&self) -> RuleFlags {
        self.spec.flags
    }

    #[must_use]
    pub fn pool(&self) -> Pool {
        self.pool
    }

    /// Address family the rule is restricted to, if its addresses pin one.
    #[must_use]
    pub fn family(&self) -> Option<IpFamily> {
        self.family
    }

    #[must_use]
    pub fn nets(&self) -> Option<NetPair> {
        self.nets
    }

    #[must_use]
    pub fn divert(&self) -> Option<DivertSpec> {
        self.spec.divert
    }

    #[must_use]
    pub fn timeouts(&self) -> RuleTimeouts {
        self.spec.timeouts
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.spec.proxy.as_deref()
    }

    /// Port range translated ports are taken from, `None` when ports are kept.
    #[must_use]
    pub fn xlat_ports(&self) -> Option<PortRange> {
        match self.spec.kind {
            RuleKind::Map => {
                if self.spec.port_mode == PortMode::Fixed
                    || self.spec.flags.contains(RuleFlags::FIXED_SPORT)
                {
                    None
                } else if self.spec.port_mode == PortMode::Auto {
                    Some(self.spec.ports.unwrap_or_else(PortRange::unprivileged))
                } else {
                    self.spec.ports
                }
            }
            RuleKind::Redirect => {
                if self.spec.flags.contains(RuleFlags::FIXED_DPORT) {
                    None
                } else {
                    self.spec.ports
                }
            }
            RuleKind::MapBlock | RuleKind::Divert => {
                Some(self.spec.ports.unwrap_or_else(PortRange::unprivileged))
            }
            RuleKind::Bimap => None,
        }
    }

    /// Number of translations the pool can hold.
    #[must_use]
    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    /// Whether the rule applies to packets travelling in `dir`.
    #[must_use]
    pub fn applies_to(&self, dir: NatDirection) -> bool {
        match self.spec.kind {
            RuleKind::Map | RuleKind::MapBlock | RuleKind::Divert => dir == NatDirection::Outbound,
            RuleKind::Redirect => dir == NatDirection::Inbound,
            RuleKind::Bimap => true,
        }
    }

    /// Evaluate the rule predicate against a flow travelling in `dir`, seen on `iface`.
    #[must_use]
    pub fn matches(
        &self,
        flow: &NatTuple,
        dir: NatDirection,
        iface: Option<&str>,
        tables: &dyn AddrTables,
    ) -> bool {
        if self.is_deleted() || !self.applies_to(dir) {
            return false;
        }
        if self.family.is_some_and(|family| family != flow.family()) {
            return false;
        }
        // a rule bound to an interface never matches a packet seen on none
        if let Some(bound) = &self.spec.interface
            && iface != Some(bound.as_str())
        {
            return false;
        }
        if let Some(proto) = self.spec.proto
            && proto != flow.proto
        {
            return false;
        }
        if self.spec.kind == RuleKind::Bimap && dir == NatDirection::Inbound {
            // inbound bimap traffic is addressed to the pool network
            return self.nets.is_some_and(|nets| nets.pool.contains(&flow.dst))
                && self.spec.dst.matches(flow.src, tables);
        }
        if !self.spec.src.matches(flow.src, tables) || !self.spec.dst.matches(flow.dst, tables) {
            return false;
        }
        let port_checks = [(self.spec.sports, flow.sport), (self.spec.dports, flow.dport)];
        for (range, port) in port_checks {
            if let Some(range) = range
                && (!flow.proto.has_ports() || !range.contains(port))
            {
                return false;
            }
        }
        true
    }

    /// Whether the datagram quoted by an ICMP error is the tunnel header this divert rule
    /// produces.
    #[must_use]
    pub fn matches_encap_reply(&self, quoted: &NatTuple) -> bool {
        let Some(divert) = self.spec.divert else {
            return false;
        };
        quoted.proto == NextHeader::UDP
            && quoted.src == divert.local
            && quoted.dst == divert.remote
            && quoted.dport == divert.dport
            && self
                .xlat_ports()
                .is_none_or(|ports| ports.contains(quoted.sport))
    }

    pub fn cursor(&self) -> parking_lot::MutexGuard<'_, PoolCursor> {
        self.cursor.lock()
    }

    #[must_use]
    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Translations left in the pool, as far as the rule can tell. Sessions sharing a
    /// translation make this an underestimate.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.pool_size.saturating_sub(u64::from(self.use_count()))
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A session now references the rule.
    pub(crate) fn acquire(&self) {
        self.use_count.fetch_add(1, Ordering::AcqRel);
    }

    /// A session referencing the rule went away.
    pub(crate) fn release(&self) {
        let released = self.use_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(released > 0, "rule {} released more often than acquired", self.id);
    }
}
