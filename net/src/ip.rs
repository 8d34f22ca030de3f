// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IP protocol numbers and address family helpers.

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The IP protocol number (IPv4 `protocol`, IPv6 `next header`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct NextHeader(u8);

impl NextHeader {
    /// IPv6 hop-by-hop options
    pub const HOPOPT: NextHeader = NextHeader(0);
    /// Internet Control Message Protocol
    pub const ICMP: NextHeader = NextHeader(1);
    /// Transmission Control Protocol
    pub const TCP: NextHeader = NextHeader(6);
    /// User Datagram Protocol
    pub const UDP: NextHeader = NextHeader(17);
    /// IPv6 routing header
    pub const IPV6_ROUTE: NextHeader = NextHeader(43);
    /// IPv6 fragment extension header
    pub const IPV6_FRAGMENT: NextHeader = NextHeader(44);
    /// ICMP for IPv6
    pub const ICMP6: NextHeader = NextHeader(58);
    /// IPv6 destination options
    pub const IPV6_DSTOPTS: NextHeader = NextHeader(60);

    /// Wrap a raw protocol number.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        NextHeader(raw)
    }

    /// The raw protocol number.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    /// Whether this is ICMP of either family.
    #[must_use]
    pub fn is_icmp(self) -> bool {
        self == Self::ICMP || self == Self::ICMP6
    }

    /// IPv6 extension headers with the generic (next header, length) layout.
    #[must_use]
    pub fn is_ipv6_options(self) -> bool {
        self == Self::HOPOPT || self == Self::IPV6_ROUTE || self == Self::IPV6_DSTOPTS
    }

    /// Whether the protocol carries 16-bit ports in the first four bytes of its header.
    #[must_use]
    pub fn has_ports(self) -> bool {
        self == Self::TCP || self == Self::UDP
    }
}

impl From<u8> for NextHeader {
    fn from(value: u8) -> Self {
        NextHeader(value)
    }
}

impl Display for NextHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ICMP => write!(f, "icmp"),
            Self::TCP => write!(f, "tcp"),
            Self::UDP => write!(f, "udp"),
            Self::ICMP6 => write!(f, "icmp6"),
            NextHeader(other) => write!(f, "proto-{other}"),
        }
    }
}

/// The IP version of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    /// Family of an address.
    #[must_use]
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Number of bits in an address of this family.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// The unspecified address of this family.
    #[must_use]
    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// The ICMP protocol number of this family.
    #[must_use]
    pub fn icmp(self) -> NextHeader {
        match self {
            IpFamily::V4 => NextHeader::ICMP,
            IpFamily::V6 => NextHeader::ICMP6,
        }
    }
}

impl Display for IpFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Address as an unsigned integer (IPv4 addresses occupy the low 32 bits).
#[must_use]
pub fn addr_to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(v4.to_bits()),
        IpAddr::V6(v6) => v6.to_bits(),
    }
}

/// Inverse of [`addr_to_bits`]. Returns `None` if `bits` does not fit in the family.
#[must_use]
pub fn addr_from_bits(family: IpFamily, bits: u128) -> Option<IpAddr> {
    match family {
        IpFamily::V4 => u32::try_from(bits)
            .ok()
            .map(|b| IpAddr::V4(Ipv4Addr::from_bits(b))),
        IpFamily::V6 => Some(IpAddr::V6(Ipv6Addr::from_bits(bits))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn bits_round_trip() {
        let v4: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(addr_to_bits(v4), 0x0a00_0005);
        assert_eq!(addr_from_bits(IpFamily::V4, 0x0a00_0005), Some(v4));
        assert_eq!(addr_from_bits(IpFamily::V4, 1 << 32), None);
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(addr_from_bits(IpFamily::V6, addr_to_bits(v6)), Some(v6));
    }

    #[test]
    fn protocol_display() {
        assert_eq!(NextHeader::TCP.to_string(), "tcp");
        assert_eq!(NextHeader::new(47).to_string(), "proto-47");
        assert!(NextHeader::UDP.has_ports());
        assert!(!NextHeader::ICMP.has_ports());
        assert!(NextHeader::HOPOPT.is_ipv6_options());
        assert!(NextHeader::IPV6_DSTOPTS.is_ipv6_options());
        assert!(!NextHeader::IPV6_FRAGMENT.is_ipv6_options());
    }
}
