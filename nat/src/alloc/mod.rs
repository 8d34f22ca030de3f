// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Choosing translated addresses and ports.
//!
//! The allocator is stateless apart from the cursor kept in each rule. It produces the
//! translated tuple of a new session, checking every candidate against the session table so
//! that no two sessions share a translated tuple.

pub mod hostmap;

use crate::NatDirection;
use crate::lookup::InterfaceResolver;
use crate::ranges::{IpPortRange, IpRange, PortRange};
use crate::rules::{NatRule, PortMode, Pool, RuleFlags, RuleKind};
use crate::session::{NatTuple, SessionTable};
use hostmap::{HostMap, HostMapCache};
use net::ip::{IpFamily, NextHeader, addr_from_bits, addr_to_bits};
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;

#[allow(unused)]
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum AllocError {
    /// Every candidate is in use; the next rule may be tried
    #[error("translation pool exhausted")]
    Exhausted,
    #[error("interface {0} has no {1} address")]
    NoInterfaceAddress(String, IpFamily),
    #[error("unsupported translation: {0}")]
    Unsupported(&'static str),
}

/// The outcome of an allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Translated tuple, in the orientation of the initiating packet
    pub xlat: NatTuple,
    pub hostmap: Option<Arc<HostMap>>,
    /// Candidates examined
    pub attempts: u64,
}

/// Whether the translated port of a flow is its identifier / port.
fn carries_ports(flow: &NatTuple) -> bool {
    flow.proto.has_ports() || flow.is_icmp_query()
}

fn with_src(flow: &NatTuple, addr: IpAddr, port: Option<u16>) -> NatTuple {
    let mut out = NatTuple { src: addr, ..*flow };
    if let Some(port) = port {
        out.sport = port;
        if flow.is_icmp_query() {
            out.dport = port;
        }
    }
    out
}

fn with_dst(flow: &NatTuple, addr: IpAddr, port: Option<u16>) -> NatTuple {
    let mut out = NatTuple { dst: addr, ..*flow };
    if let Some(port) = port {
        out.dport = port;
        if flow.is_icmp_query() {
            out.sport = port;
        }
    }
    out
}

/// Offset of `addr` in `net`, and the number of addresses of `net` (saturating).
fn host_offset(net: ipnet::IpNet, addr: IpAddr) -> (u128, u128) {
    let range = IpRange::from_net(net, false);
    (range.offset_of(&addr).unwrap_or(0), range.len())
}

pub struct Allocator<'a> {
    table: &'a SessionTable,
    hostmaps: &'a mut HostMapCache,
    resolver: &'a dyn InterfaceResolver,
    search_limit: u64,
}

impl<'a> Allocator<'a> {
    pub fn new(
        table: &'a SessionTable,
        hostmaps: &'a mut HostMapCache,
        resolver: &'a dyn InterfaceResolver,
        search_limit: u64,
    ) -> Self {
        Self {
            table,
            hostmaps,
            resolver,
            search_limit: search_limit.max(1),
        }
    }

    /// Translate `flow`, the tuple of the first packet of a session, travelling in `dir` on
    /// `iface`, under `rule`.
    ///
    /// # Errors
    ///
    /// [`AllocError::Exhausted`] when every candidate collides, other variants when the rule
    /// cannot translate this flow at all.
    pub fn allocate(
        &mut self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
        iface: Option<&str>,
    ) -> Result<Allocation, AllocError> {
        match rule.kind() {
            RuleKind::Map => self.map(rule, dir, flow, iface),
            RuleKind::Redirect => self.redirect(rule, dir, flow, iface),
            RuleKind::Bimap => self.bimap(rule, dir, flow),
            RuleKind::MapBlock => self.map_block(rule, dir, flow),
            RuleKind::Divert => self.divert(rule, dir, flow),
        }
    }

    fn interface_addr(
        &self,
        rule: &NatRule,
        iface: Option<&str>,
        family: IpFamily,
    ) -> Result<IpAddr, AllocError> {
        let name = rule
            .spec()
            .interface
            .as_deref()
            .or(iface)
            .ok_or(AllocError::Unsupported("interface pool without an interface"))?;
        self.resolver
            .address(name, family)
            .ok_or_else(|| AllocError::NoInterfaceAddress(name.to_string(), family))
    }

    /// The addresses a rule translates to, for a flow of family `family` whose rewritten
    /// address is currently `current`.
    fn addresses(
        &self,
        rule: &NatRule,
        iface: Option<&str>,
        family: IpFamily,
        current: IpAddr,
    ) -> Result<IpRange, AllocError> {
        match rule.pool() {
            Pool::Interface => Ok(IpRange::single(self.interface_addr(rule, iface, family)?)),
            Pool::Identity => Ok(IpRange::single(current)),
            Pool::Range(range) if range.family() == family => Ok(range),
            Pool::Split(a, b) if IpFamily::of(&a) == family => {
                // a split pool walks both addresses; redirects alternate explicitly
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                Ok(IpRange::new(lo, hi).unwrap_or(IpRange::single(a)))
            }
            Pool::Range(_) | Pool::Split(..) => Err(AllocError::Unsupported("address family")),
        }
    }

    fn sticky_map(&self, rule: &NatRule, flow: &NatTuple) -> Option<Arc<HostMap>> {
        let wants = rule.flags().contains(RuleFlags::STICKY) || !carries_ports(flow);
        if wants {
            self.hostmaps.get(rule.id(), flow.src, flow.dst)
        } else {
            None
        }
    }

    fn remember(
        &mut self,
        rule: &NatRule,
        flow: &NatTuple,
        xlat: IpAddr,
        port: Option<u16>,
    ) -> Option<Arc<HostMap>> {
        let wants = rule.flags().contains(RuleFlags::STICKY) || !carries_ports(flow);
        wants.then(|| {
            self.hostmaps.insert(HostMap {
                rule: rule.id(),
                orig_src: flow.src,
                orig_dst: flow.dst,
                xlat,
                port,
            })
        })
    }

    /// Source translation.
    fn map(
        &mut self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
        iface: Option<&str>,
    ) -> Result<Allocation, AllocError> {
        let family = flow.family();
        let sticky = self.sticky_map(rule, flow);
        let addrs = match &sticky {
            Some(map) => IpRange::single(map.xlat),
            None => self.addresses(rule, iface, family, flow.src)?,
        };
        let ports = rule.xlat_ports().filter(|_| carries_ports(flow));

        let (xlat, attempts) = match (ports, rule.spec().port_mode) {
            (Some(ports), PortMode::Auto) => self.auto_ports(rule, dir, flow, addrs, ports)?,
            (Some(ports), mode) => {
                let space = IpPortRange::new(addrs, ports);
                self.search(rule, dir, mode == PortMode::Random, space.size(), |off| {
                    space
                        .get_entry(off)
                        .map(|(addr, port)| with_src(flow, addr, Some(port)))
                })?
            }
            (None, _) => self.search(rule, dir, false, addrs.len(), |off| {
                addrs.get_entry(off).map(|addr| with_src(flow, addr, None))
            })?,
        };
        let hostmap = match sticky {
            Some(map) => Some(map),
            None => self.remember(rule, flow, xlat.src, None),
        };
        Ok(Allocation {
            xlat,
            hostmap,
            attempts,
        })
    }

    /// Walk the candidate space of size `size` from the rule cursor (or a random point) and
    /// return the first candidate that does not collide. The cursor is left after the returned
    /// candidate. At most `min(size, search limit)` candidates are examined.
    fn search(
        &self,
        rule: &NatRule,
        dir: NatDirection,
        random: bool,
        size: u128,
        candidate: impl Fn(u128) -> Option<NatTuple>,
    ) -> Result<(NatTuple, u64), AllocError> {
        if size == 0 {
            return Err(AllocError::Exhausted);
        }
        let limit = size.min(u128::from(self.search_limit));
        let mut cursor = rule.cursor();
        let start = if random {
            u128::from(rand::rng().next_u64()) % size
        } else {
            cursor.offset % size
        };
        for i in 0..limit {
            let offset = (start + i) % size;
            let Some(xlat) = candidate(offset) else {
                continue;
            };
            if !self.table.collides(dir, &xlat) {
                cursor.offset = (offset + 1) % size;
                let attempts = u64::try_from(i + 1).unwrap_or(u64::MAX);
                return Ok((xlat, attempts));
            }
        }
        // the next search starts where this one gave up
        cursor.offset = (start + limit) % size;
        debug!(
            "Rule {} exhausted after {limit} candidates (pool of {size})",
            rule.id()
        );
        Err(AllocError::Exhausted)
    }

    /// Auto port mapping: every original address owns `ports_per_host` consecutive slots of the
    /// pool's address x port space.
    fn auto_ports(
        &self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
        addrs: IpRange,
        ports: PortRange,
    ) -> Result<(NatTuple, u64), AllocError> {
        let space = IpPortRange::new(addrs, ports);
        let slots = space.size();
        let (offset, hosts) = match rule.spec().src.plain_net() {
            Some(net) => host_offset(net, flow.src),
            None => (0, 1),
        };
        let per_host = (slots / hosts.max(1)).max(1);
        let base = offset.saturating_mul(per_host);
        for attempt in 0..per_host.min(u128::from(self.search_limit)) {
            let slot = (base + (u128::from(flow.sport) + attempt) % per_host) % slots;
            let Some((addr, port)) = space.get_entry(slot) else {
                continue;
            };
            let xlat = with_src(flow, addr, Some(port));
            if !self.table.collides(dir, &xlat) {
                let attempts = u64::try_from(attempt + 1).unwrap_or(u64::MAX);
                return Ok((xlat, attempts));
            }
        }
        Err(AllocError::Exhausted)
    }

    /// Destination translation of inbound traffic.
    fn redirect(
        &mut self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
        iface: Option<&str>,
    ) -> Result<Allocation, AllocError> {
        let family = flow.family();
        let port = match rule.xlat_ports().filter(|_| flow.proto.has_ports()) {
            None => None,
            Some(target) => Some(match rule.spec().dports {
                Some(matched) => matched
                    .map_port_to(flow.dport, target)
                    .map_or(target.first(), |p| p.get()),
                None => target.first(),
            }),
        };

        if let Some(map) = self.sticky_map(rule, flow) {
            let xlat = with_dst(flow, map.xlat, map.port.or(port));
            if self.table.collides(dir, &xlat) {
                return Err(AllocError::Exhausted);
            }
            return Ok(Allocation {
                xlat,
                hostmap: Some(map),
                attempts: 1,
            });
        }

        let (xlat, attempts) = if let Pool::Split(first, second) = rule.pool() {
            if IpFamily::of(&first) != family {
                return Err(AllocError::Unsupported("address family"));
            }
            let mut cursor = rule.cursor();
            let order = if cursor.second {
                [second, first]
            } else {
                [first, second]
            };
            let mut found = None;
            for (i, addr) in order.into_iter().enumerate() {
                let xlat = with_dst(flow, addr, port);
                if !self.table.collides(dir, &xlat) {
                    cursor.second = addr == first;
                    found = Some((xlat, u64::try_from(i).unwrap_or(0) + 1));
                    break;
                }
            }
            found.ok_or(AllocError::Exhausted)?
        } else {
            let addrs = self.addresses(rule, iface, family, flow.dst)?;
            self.search(rule, dir, false, addrs.len(), |off| {
                addrs.get_entry(off).map(|addr| with_dst(flow, addr, port))
            })?
        };
        let hostmap = self.remember(rule, flow, xlat.dst, port);
        Ok(Allocation {
            xlat,
            hostmap,
            attempts,
        })
    }

    /// Static 1:1 translation between the source network and the pool network.
    fn bimap(
        &mut self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
    ) -> Result<Allocation, AllocError> {
        let nets = rule.nets().ok_or(AllocError::Unsupported("bimap without networks"))?;
        let (from, to, addr) = match dir {
            NatDirection::Outbound => (nets.orig, nets.pool, flow.src),
            NatDirection::Inbound => (nets.pool, nets.orig, flow.dst),
        };
        let family = IpFamily::of(&to.addr());
        if IpFamily::of(&addr) != family {
            return Err(AllocError::Unsupported("address family"));
        }
        let host = addr_to_bits(addr) & addr_to_bits(from.hostmask());
        let mapped = addr_from_bits(family, addr_to_bits(to.network()) | host)
            .ok_or(AllocError::Unsupported("address out of range"))?;
        let xlat = match dir {
            NatDirection::Outbound => with_src(flow, mapped, None),
            NatDirection::Inbound => with_dst(flow, mapped, None),
        };
        if self.table.collides(dir, &xlat) {
            return Err(AllocError::Exhausted);
        }
        Ok(Allocation {
            xlat,
            hostmap: None,
            attempts: 1,
        })
    }

    /// Arithmetic source translation: original addresses are spread over the pool addresses and
    /// each gets its own block of ports.
    fn map_block(
        &mut self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
    ) -> Result<Allocation, AllocError> {
        let nets = rule
            .nets()
            .ok_or(AllocError::Unsupported("map-block without networks"))?;
        let family = IpFamily::of(&nets.pool.addr());
        if flow.family() != family {
            return Err(AllocError::Unsupported("address family"));
        }
        let (offset, orig_size) = host_offset(nets.orig, flow.src);
        let pool_size = IpRange::from_net(nets.pool, false).len();
        let ips_per_ip = orig_size.div_ceil(pool_size.max(1)).max(1);
        let addr = addr_from_bits(family, addr_to_bits(nets.pool.network()) + offset / ips_per_ip)
            .ok_or(AllocError::Unsupported("address out of range"))?;
        if !carries_ports(flow) {
            let xlat = with_src(flow, addr, None);
            if self.table.collides(dir, &xlat) {
                return Err(AllocError::Exhausted);
            }
            return Ok(Allocation {
                xlat,
                hostmap: None,
                attempts: 1,
            });
        }
        let ports = rule.xlat_ports().unwrap_or_else(PortRange::unprivileged);
        let ports_per_ip = u128::from(ports.len()) / ips_per_ip;
        if ports_per_ip == 0 {
            return Err(AllocError::Unsupported("port range too small for the block"));
        }
        let block = u128::from(ports.first()) + ports_per_ip * (offset % ips_per_ip);
        for attempt in 0..ports_per_ip.min(u128::from(self.search_limit)) {
            let port = block + (u128::from(flow.sport) + attempt) % ports_per_ip;
            let port = u16::try_from(port).map_err(|_| AllocError::Exhausted)?;
            let xlat = with_src(flow, addr, Some(port));
            if !self.table.collides(dir, &xlat) {
                return Ok(Allocation {
                    xlat,
                    hostmap: None,
                    attempts: u64::try_from(attempt + 1).unwrap_or(u64::MAX),
                });
            }
        }
        Err(AllocError::Exhausted)
    }

    /// Divert: the translated tuple is the UDP tunnel header the encapsulation layer will add.
    fn divert(
        &mut self,
        rule: &NatRule,
        dir: NatDirection,
        flow: &NatTuple,
    ) -> Result<Allocation, AllocError> {
        let divert = rule.divert().ok_or(AllocError::Unsupported("divert without tunnel"))?;
        let ports = rule.xlat_ports().unwrap_or_else(PortRange::unprivileged);
        let tunnel = |port: u16| {
            NatTuple::new(NextHeader::UDP, divert.local, port, divert.remote, divert.dport)
        };
        let (xlat, attempts) = self.search(rule, dir, false, u128::from(ports.len()), |off| {
            let off = u16::try_from(off).ok()?;
            ports.get_port_at(off).map(|p| tunnel(p.get()))
        })?;
        Ok(Allocation {
            xlat,
            hostmap: None,
            attempts,
        })
    }
}
