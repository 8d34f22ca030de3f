// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Address and port ranges translation pools are carved from.

mod portrange;

pub use portrange::{PortRange, PortSpec};

use ipnet::IpNet;
use net::ip::{IpFamily, addr_from_bits, addr_to_bits};
use std::fmt::Display;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum RangeError {
    #[error("invalid port {0}")]
    InvalidPort(u16),
    #[error("invalid port range: {0}-{1}")]
    InvalidPortRange(u16, u16),
    #[error("invalid address range: {0}-{1}")]
    InvalidAddrRange(IpAddr, IpAddr),
}

/// An inclusive range of addresses of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpRange {
    start: IpAddr,
    end: IpAddr,
}

impl IpRange {
    /// Build a range from its bounds.
    ///
    /// # Errors
    ///
    /// Fails if the bounds differ in family or are not ordered.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, RangeError> {
        if start.is_ipv4() != end.is_ipv4() || start > end {
            return Err(RangeError::InvalidAddrRange(start, end));
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn single(addr: IpAddr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// The addresses of a prefix. With `skip_edges`, IPv4 prefixes shorter than /31 lose their
    /// network and broadcast addresses.
    #[must_use]
    pub fn from_net(net: IpNet, skip_edges: bool) -> Self {
        let start = addr_to_bits(net.network());
        let end = addr_to_bits(net.broadcast());
        let family = IpFamily::of(&net.addr());
        let (start, end) = if skip_edges && family == IpFamily::V4 && net.prefix_len() < 31 {
            (start + 1, end - 1)
        } else {
            (start, end)
        };
        Self {
            start: addr_from_bits(family, start).unwrap_or(net.network()),
            end: addr_from_bits(family, end).unwrap_or(net.broadcast()),
        }
    }

    #[must_use]
    pub fn start(&self) -> IpAddr {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> IpAddr {
        self.end
    }

    #[must_use]
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.start)
    }

    #[must_use]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        addr.is_ipv4() == self.start.is_ipv4() && self.start <= *addr && *addr <= self.end
    }

    /// Number of addresses in the range. The whole IPv6 space saturates at `u128::MAX`.
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u128 {
        (addr_to_bits(self.end) - addr_to_bits(self.start)).saturating_add(1)
    }

    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.start == self.end
    }

    /// The address at `offset` from the start of the range.
    #[must_use]
    pub fn get_entry(&self, offset: u128) -> Option<IpAddr> {
        if offset >= self.len() {
            return None;
        }
        addr_from_bits(self.family(), addr_to_bits(self.start) + offset)
    }

    /// Inverse of [`IpRange::get_entry`].
    #[must_use]
    pub fn offset_of(&self, addr: &IpAddr) -> Option<u128> {
        self.contains(addr)
            .then(|| addr_to_bits(*addr) - addr_to_bits(self.start))
    }
}

impl Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_singleton() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// The cartesian product of an address range and a port range, walked address-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPortRange {
    pub ip_range: IpRange,
    pub port_range: PortRange,
}

impl IpPortRange {
    #[must_use]
    pub fn new(ip_range: IpRange, port_range: PortRange) -> Self {
        Self {
            ip_range,
            port_range,
        }
    }

    #[must_use]
    pub fn size(&self) -> u128 {
        self.ip_range
            .len()
            .saturating_mul(u128::from(self.port_range.len()))
    }

    #[must_use]
    pub fn get_entry(&self, offset: u128) -> Option<(IpAddr, u16)> {
        if offset >= self.size() {
            return None;
        }
        let ports = u128::from(self.port_range.len());
        let ip_offset = offset / ports;
        let port_offset = u16::try_from(offset % ports).unwrap_or_else(|_| unreachable!());
        self.ip_range
            .get_entry(ip_offset)
            .zip(self.port_range.get_port_at(port_offset).map(|p| p.get()))
    }
}
