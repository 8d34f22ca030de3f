// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A mutable view over one IP datagram.
//!
//! [`Packet::parse`] validates the IP header with `etherparse`, records the offsets of the
//! transport header and classifies the payload into a [`Transport`]. All later access reads and
//! writes the owned buffer directly, so edits happen in place.

mod edit;
mod meta;

#[cfg(any(test, feature = "test_buffer"))]
pub mod test_utils;

#[cfg(test)]
mod test;

pub use edit::{ChecksumContext, EditError, EmbeddedEdit, Translation};
pub use meta::{DivertAction, PacketMeta, Tunnel};

use crate::checksum::checksum;
use crate::icmp::{IcmpClass, classify};
use crate::ip::{IpFamily, NextHeader};
use crate::tcp::TcpFlags;
use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Errors which may occur while parsing a datagram.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing to parse
    #[error("empty buffer")]
    Empty,
    /// Not version 4 or 6
    #[error("unsupported IP version {0}")]
    Version(u8),
    /// Rejected by the IPv4 header parser
    #[error("invalid IPv4 header: {0}")]
    Ipv4(String),
    /// Rejected by the IPv6 header parser
    #[error("invalid IPv6 header: {0}")]
    Ipv6(String),
}

/// Fragmentation status of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fragment {
    /// Identification (16 bits for IPv4, 32 bits for IPv6)
    pub id: u32,
    /// Offset in 8-byte units
    pub offset: u16,
    /// More fragments follow
    pub more: bool,
}

impl Fragment {
    /// The fragment that carries the transport header.
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.offset == 0
    }
}

/// The transport layer of a datagram, as far as translation is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// TCP segment
    Tcp {
        /// source port
        sport: u16,
        /// destination port
        dport: u16,
        /// control bits
        flags: TcpFlags,
    },
    /// UDP datagram
    Udp {
        /// source port
        sport: u16,
        /// destination port
        dport: u16,
    },
    /// ICMP echo/timestamp/information/mask request or reply
    IcmpQuery {
        /// ICMP type
        icmp_type: u8,
        /// ICMP code
        code: u8,
        /// query identifier
        id: u16,
    },
    /// ICMP error quoting the offending datagram
    IcmpError {
        /// ICMP type
        icmp_type: u8,
        /// ICMP code
        code: u8,
        /// the quoted header
        embedded: Embedded,
    },
    /// Any other protocol, other ICMP messages, non-first fragments, or truncated headers
    Other,
}

/// Transport fields of the datagram quoted in an ICMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedTransport {
    /// TCP or UDP ports
    Ports {
        /// source port
        sport: u16,
        /// destination port
        dport: u16,
    },
    /// ICMP query
    IcmpQuery {
        /// ICMP type
        icmp_type: u8,
        /// query identifier
        id: u16,
    },
    /// Not enough bytes quoted, or no ports
    Other,
}

/// The header of the datagram quoted in an ICMP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedded {
    /// quoted source address
    pub src: IpAddr,
    /// quoted destination address
    pub dst: IpAddr,
    /// quoted protocol
    pub proto: NextHeader,
    /// quoted transport fields
    pub transport: EmbeddedTransport,
    /// whether the quoted IPv4 header checksum is correct (always true for IPv6)
    pub ip_checksum_ok: bool,
    ip_offset: usize,
    l4_offset: usize,
    l4_captured: usize,
}

/// One IP datagram plus its metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    family: IpFamily,
    proto: NextHeader,
    l4: usize,
    end: usize,
    fragment: Option<Fragment>,
    transport: Transport,
    meta: PacketMeta,
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn read_addr(buf: &[u8], family: IpFamily, at: usize) -> Option<IpAddr> {
    match family {
        IpFamily::V4 => {
            let raw: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(raw)))
        }
        IpFamily::V6 => {
            let raw: [u8; 16] = buf.get(at..at + 16)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(raw)))
        }
    }
}

/// Offsets of the source and destination addresses in an IP header.
pub(crate) fn addr_offsets(family: IpFamily) -> (usize, usize) {
    match family {
        IpFamily::V4 => (12, 16),
        IpFamily::V6 => (8, 24),
    }
}

/// Offset of the transport checksum within its header.
pub(crate) fn l4_checksum_offset(proto: NextHeader) -> Option<usize> {
    match proto {
        NextHeader::TCP => Some(16),
        NextHeader::UDP => Some(6),
        NextHeader::ICMP | NextHeader::ICMP6 => Some(2),
        _ => None,
    }
}

struct IpLayout {
    family: IpFamily,
    proto: NextHeader,
    l4: usize,
    end: usize,
    fragment: Option<Fragment>,
    src: IpAddr,
    dst: IpAddr,
    ip_checksum_ok: bool,
}

/// Walk the IPv6 extension headers following the fixed header. Returns the upper-layer protocol,
/// its offset and the fragment header if there is one. A truncated extension header stops the
/// walk with the extension header itself as the protocol; so does the fragment header of a
/// non-first fragment, after which only payload follows.
fn ipv6_upper_layer(buf: &[u8], first: NextHeader) -> (NextHeader, usize, Option<Fragment>) {
    let mut proto = first;
    let mut at = 40;
    let mut fragment = None;
    loop {
        if proto.is_ipv6_options() {
            let (Some(&next), Some(&len)) = (buf.get(at), buf.get(at + 1)) else {
                break;
            };
            let size = (usize::from(len) + 1) * 8;
            if at + size > buf.len() {
                break;
            }
            proto = NextHeader::new(next);
            at += size;
        } else if proto == NextHeader::IPV6_FRAGMENT {
            let Some(ext) = buf.get(at..at + 8) else {
                break;
            };
            let off = u16::from_be_bytes([ext[2], ext[3]]);
            let frag = Fragment {
                id: u32::from_be_bytes([ext[4], ext[5], ext[6], ext[7]]),
                offset: off >> 3,
                more: off & 1 == 1,
            };
            fragment = Some(frag);
            proto = NextHeader::new(ext[0]);
            at += 8;
            if !frag.is_first() {
                break;
            }
        } else {
            break;
        }
    }
    (proto, at, fragment)
}

fn parse_ip(buf: &[u8]) -> Result<IpLayout, ParseError> {
    let first = *buf.first().ok_or(ParseError::Empty)?;
    match first >> 4 {
        4 => {
            let hdr =
                Ipv4HeaderSlice::from_slice(buf).map_err(|e| ParseError::Ipv4(e.to_string()))?;
            let l4 = usize::from(hdr.ihl()) * 4;
            let offset = hdr.fragments_offset().value();
            let fragment = (hdr.more_fragments() || offset != 0).then(|| Fragment {
                id: u32::from(hdr.identification()),
                offset,
                more: hdr.more_fragments(),
            });
            Ok(IpLayout {
                family: IpFamily::V4,
                proto: NextHeader::new(hdr.protocol().0),
                l4,
                end: buf.len().min(usize::from(hdr.total_len())).max(l4),
                fragment,
                src: IpAddr::V4(hdr.source_addr()),
                dst: IpAddr::V4(hdr.destination_addr()),
                ip_checksum_ok: checksum(&buf[..l4]) == 0,
            })
        }
        6 => {
            let hdr =
                Ipv6HeaderSlice::from_slice(buf).map_err(|e| ParseError::Ipv6(e.to_string()))?;
            let first = NextHeader::new(hdr.next_header().0);
            let (proto, l4, fragment) = ipv6_upper_layer(buf, first);
            Ok(IpLayout {
                family: IpFamily::V6,
                proto,
                l4,
                end: buf.len().min(40 + usize::from(hdr.payload_length())).max(l4),
                fragment,
                src: IpAddr::V6(hdr.source_addr()),
                dst: IpAddr::V6(hdr.destination_addr()),
                ip_checksum_ok: true,
            })
        }
        v => Err(ParseError::Version(v)),
    }
}

fn parse_embedded(buf: &[u8], family: IpFamily, at: usize) -> Option<Embedded> {
    let quoted = buf.get(at..)?;
    let inner = parse_ip(quoted).ok()?;
    if inner.family != family {
        return None;
    }
    let l4_offset = at + inner.l4;
    let l4_captured = buf.len().saturating_sub(l4_offset);
    let transport = match inner.proto {
        p if p.has_ports() && l4_captured >= 4 => EmbeddedTransport::Ports {
            sport: read_u16(buf, l4_offset)?,
            dport: read_u16(buf, l4_offset + 2)?,
        },
        p if p == family.icmp() && l4_captured >= 6 => {
            let icmp_type = buf[l4_offset];
            if crate::icmp::is_query(family, icmp_type) {
                EmbeddedTransport::IcmpQuery {
                    icmp_type,
                    id: read_u16(buf, l4_offset + 4)?,
                }
            } else {
                EmbeddedTransport::Other
            }
        }
        _ => EmbeddedTransport::Other,
    };
    Some(Embedded {
        src: inner.src,
        dst: inner.dst,
        proto: inner.proto,
        transport,
        ip_checksum_ok: inner.ip_checksum_ok,
        ip_offset: at,
        l4_offset,
        l4_captured,
    })
}

fn parse_transport(
    buf: &[u8],
    family: IpFamily,
    proto: NextHeader,
    l4: usize,
    end: usize,
    fragment: Option<Fragment>,
) -> Transport {
    if fragment.is_some_and(|f| !f.is_first()) {
        return Transport::Other;
    }
    let avail = end.saturating_sub(l4);
    match proto {
        NextHeader::TCP if avail >= 20 => Transport::Tcp {
            sport: read_u16(buf, l4).unwrap_or_default(),
            dport: read_u16(buf, l4 + 2).unwrap_or_default(),
            flags: TcpFlags::from_bits_truncate(buf[l4 + 13]),
        },
        NextHeader::UDP if avail >= 8 => Transport::Udp {
            sport: read_u16(buf, l4).unwrap_or_default(),
            dport: read_u16(buf, l4 + 2).unwrap_or_default(),
        },
        p if p == family.icmp() && avail >= 8 => {
            let icmp_type = buf[l4];
            let code = buf[l4 + 1];
            match classify(family, icmp_type) {
                IcmpClass::QueryRequest | IcmpClass::QueryReply => Transport::IcmpQuery {
                    icmp_type,
                    code,
                    id: read_u16(buf, l4 + 4).unwrap_or_default(),
                },
                IcmpClass::Error => match parse_embedded(&buf[..end], family, l4 + 8) {
                    Some(embedded) => Transport::IcmpError {
                        icmp_type,
                        code,
                        embedded,
                    },
                    None => Transport::Other,
                },
                IcmpClass::Other => Transport::Other,
            }
        }
        _ => Transport::Other,
    }
}

impl Packet {
    /// Parse a datagram.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if the buffer does not start with a valid IPv4 or IPv6 header.
    pub fn parse(buf: Vec<u8>) -> Result<Packet, ParseError> {
        let layout = parse_ip(&buf)?;
        let transport = parse_transport(
            &buf,
            layout.family,
            layout.proto,
            layout.l4,
            layout.end,
            layout.fragment,
        );
        Ok(Packet {
            family: layout.family,
            proto: layout.proto,
            l4: layout.l4,
            end: layout.end,
            fragment: layout.fragment,
            transport,
            meta: PacketMeta::default(),
            buf,
        })
    }

    /// Parse a datagram seen on interface `iface`.
    ///
    /// # Errors
    ///
    /// See [`Packet::parse`].
    pub fn parse_on(buf: Vec<u8>, iface: &str) -> Result<Packet, ParseError> {
        let mut packet = Packet::parse(buf)?;
        packet.meta.iface = Some(iface.to_string());
        Ok(packet)
    }

    pub(crate) fn refresh(&mut self) {
        self.transport = parse_transport(
            &self.buf,
            self.family,
            self.proto,
            self.l4,
            self.end,
            self.fragment,
        );
    }

    /// IP version.
    #[must_use]
    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Transport protocol (after any IPv6 fragment header).
    #[must_use]
    pub fn proto(&self) -> NextHeader {
        self.proto
    }

    /// Source address.
    #[must_use]
    pub fn src_addr(&self) -> IpAddr {
        let (src, _) = addr_offsets(self.family);
        read_addr(&self.buf, self.family, src).unwrap_or_else(|| unreachable!())
    }

    /// Destination address.
    #[must_use]
    pub fn dst_addr(&self) -> IpAddr {
        let (_, dst) = addr_offsets(self.family);
        read_addr(&self.buf, self.family, dst).unwrap_or_else(|| unreachable!())
    }

    /// Fragmentation status, if the datagram is a fragment.
    #[must_use]
    pub fn fragment(&self) -> Option<Fragment> {
        self.fragment
    }

    /// Parsed transport layer.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Source and destination ports (the identifier twice for ICMP queries).
    #[must_use]
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.transport {
            Transport::Tcp { sport, dport, .. } | Transport::Udp { sport, dport } => {
                Some((sport, dport))
            }
            Transport::IcmpQuery { id, .. } => Some((id, id)),
            Transport::IcmpError { .. } | Transport::Other => None,
        }
    }

    /// TCP control bits, for TCP segments.
    #[must_use]
    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        match self.transport {
            Transport::Tcp { flags, .. } => Some(flags),
            _ => None,
        }
    }

    /// Offset of the transport header.
    #[must_use]
    pub fn l4_offset(&self) -> usize {
        self.l4
    }

    /// Length of the datagram as declared by its header (capped at the buffer length).
    #[must_use]
    pub fn len(&self) -> usize {
        self.end
    }

    /// Whether the datagram has no payload beyond its IP header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.l4
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Give the buffer back.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Metadata attached by the surrounding layers and by translation.
    #[must_use]
    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    /// Mutable metadata.
    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }

    /// Stored transport checksum, if the protocol has one and it is present.
    #[must_use]
    pub fn l4_checksum(&self) -> Option<u16> {
        if self.fragment.is_some_and(|f| !f.is_first()) {
            return None;
        }
        let at = self.l4 + l4_checksum_offset(self.proto)?;
        read_u16(&self.buf[..self.end], at)
    }
}
