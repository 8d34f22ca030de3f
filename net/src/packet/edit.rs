// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-place address/port rewrites with incremental checksum repair.

use super::{EmbeddedTransport, Packet, Transport, addr_offsets, l4_checksum_offset};
use crate::checksum::{ChecksumDelta, fix_embedded, fix_inbound, fix_outbound};
use crate::ip::{IpFamily, NextHeader};
use std::net::IpAddr;

/// Which stack finalized the checksums being repaired.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumContext {
    /// Sent by a local or forwarded sender; checksums are final.
    #[default]
    Outbound,
    /// Received; the local stack validates after translation.
    Inbound,
}

impl ChecksumContext {
    fn fix(self, cksum: u16, delta: ChecksumDelta) -> u16 {
        match self {
            ChecksumContext::Outbound => fix_outbound(cksum, delta),
            ChecksumContext::Inbound => fix_inbound(cksum, delta),
        }
    }
}

/// Errors which may occur while editing a datagram.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EditError {
    /// Replacement address of the wrong family
    #[error("address family mismatch: packet is {packet}, replacement is {replacement}")]
    FamilyMismatch {
        /// family of the datagram
        packet: IpFamily,
        /// family of the replacement
        replacement: IpFamily,
    },
    /// A port was given for a datagram which has none
    #[error("datagram carries no port or identifier to rewrite")]
    NoPorts,
    /// An embedded edit was requested on something other than an ICMP error
    #[error("datagram is not an ICMP error")]
    NotIcmpError,
}

/// A rewrite of the datagram's own header fields.
///
/// The deltas are the ones precomputed for the flow: `ip_delta` covers the address change
/// (IPv4 header checksum), `l4_delta` whatever the transport checksum covers (pseudo-header
/// addresses and ports for TCP/UDP/ICMPv6, only the identifier for `ICMPv4`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// new source address
    pub src: Option<IpAddr>,
    /// new source port, or ICMP identifier
    pub src_port: Option<u16>,
    /// new destination address
    pub dst: Option<IpAddr>,
    /// new destination port, or ICMP identifier
    pub dst_port: Option<u16>,
    /// adjustment of the IPv4 header checksum
    pub ip_delta: ChecksumDelta,
    /// adjustment of the transport checksum
    pub l4_delta: ChecksumDelta,
    /// how to apply the adjustments
    pub context: ChecksumContext,
}

/// A rewrite of the datagram quoted in an ICMP error and of the error's own addresses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedEdit {
    /// new quoted source address
    pub src: Option<IpAddr>,
    /// new quoted source port, or ICMP identifier
    pub src_port: Option<u16>,
    /// new quoted destination address
    pub dst: Option<IpAddr>,
    /// new quoted destination port, or ICMP identifier
    pub dst_port: Option<u16>,
    /// adjustment of the quoted IPv4 header checksum
    pub ip_delta: ChecksumDelta,
    /// adjustment of the quoted transport checksum
    pub l4_delta: ChecksumDelta,
    /// new source address of the ICMP error itself
    pub outer_src: Option<IpAddr>,
    /// new destination address of the ICMP error itself
    pub outer_dst: Option<IpAddr>,
    /// how to apply the adjustments to the outer checksums
    pub context: ChecksumContext,
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl Packet {
    fn check_family(&self, addrs: &[Option<IpAddr>]) -> Result<(), EditError> {
        for addr in addrs.iter().flatten() {
            let replacement = IpFamily::of(addr);
            if replacement != self.family {
                return Err(EditError::FamilyMismatch {
                    packet: self.family,
                    replacement,
                });
            }
        }
        Ok(())
    }

    fn write_u16(&mut self, at: usize, value: u16) {
        self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read_u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }

    /// Replace bytes at `at`, accounting the change in `tracker` relative to `region`.
    fn replace_tracked(
        &mut self,
        at: usize,
        new: &[u8],
        region: usize,
        tracker: &mut ChecksumDelta,
    ) {
        let old = self.buf[at..at + new.len()].to_vec();
        self.buf[at..at + new.len()].copy_from_slice(new);
        tracker.track(at - region, &old, new);
    }

    /// Rewrite addresses and ports of the datagram and repair its checksums.
    ///
    /// Nothing is written if the edit is rejected.
    ///
    /// # Errors
    ///
    /// Returns an [`EditError`] if a replacement address has the wrong family or a port is
    /// requested on a datagram without ports.
    pub fn translate(&mut self, edit: &Translation) -> Result<(), EditError> {
        self.check_family(&[edit.src, edit.dst])?;
        let wants_ports = edit.src_port.is_some() || edit.dst_port.is_some();
        let has_ports = matches!(
            self.transport,
            Transport::Tcp { .. } | Transport::Udp { .. } | Transport::IcmpQuery { .. }
        );
        if wants_ports && !has_ports {
            return Err(EditError::NoPorts);
        }

        let (src_at, dst_at) = addr_offsets(self.family);
        if let Some(src) = edit.src {
            self.buf[src_at..dst_at].copy_from_slice(&addr_bytes(src));
        }
        if let Some(dst) = edit.dst {
            let len = dst_at - src_at;
            self.buf[dst_at..dst_at + len].copy_from_slice(&addr_bytes(dst));
        }
        if self.family == IpFamily::V4 && (edit.src.is_some() || edit.dst.is_some()) {
            let ck = self.read_u16_at(10);
            self.write_u16(10, edit.context.fix(ck, edit.ip_delta));
        }

        let l4 = self.l4;
        match self.transport {
            Transport::Tcp { .. } | Transport::Udp { .. } => {
                if let Some(port) = edit.src_port {
                    self.write_u16(l4, port);
                }
                if let Some(port) = edit.dst_port {
                    self.write_u16(l4 + 2, port);
                }
            }
            Transport::IcmpQuery { .. } => {
                if let Some(id) = edit.src_port.or(edit.dst_port) {
                    self.write_u16(l4 + 4, id);
                }
            }
            Transport::IcmpError { .. } | Transport::Other => {}
        }

        let first = self.fragment.is_none_or(|f| f.is_first());
        let covered = !matches!(self.transport, Transport::Other | Transport::IcmpError { .. });
        if first
            && covered
            && let Some(off) = l4_checksum_offset(self.proto)
        {
            let at = l4 + off;
            let ck = self.read_u16_at(at);
            let udp4 = self.proto == NextHeader::UDP && self.family == IpFamily::V4;
            if !(udp4 && ck == 0) {
                let mut fixed = edit.context.fix(ck, edit.l4_delta);
                if self.proto == NextHeader::UDP && fixed == 0 {
                    fixed = 0xffff;
                }
                self.write_u16(at, fixed);
            }
        }

        self.refresh();
        self.meta.natted = true;
        Ok(())
    }

    /// Rewrite the datagram quoted by an ICMP error, then the error's own addresses, repairing
    /// the quoted IPv4 header checksum, the quoted transport checksum (when quoted and non-zero),
    /// the ICMP checksum and the outer IPv4 header checksum.
    ///
    /// # Errors
    ///
    /// Returns an [`EditError`] if the datagram is not an ICMP error, an address has the wrong
    /// family, or a port is requested for a quoted datagram without ports.
    pub fn translate_embedded(&mut self, edit: &EmbeddedEdit) -> Result<(), EditError> {
        let Transport::IcmpError { embedded, .. } = &self.transport else {
            return Err(EditError::NotIcmpError);
        };
        let embedded = embedded.clone();
        self.check_family(&[edit.src, edit.dst, edit.outer_src, edit.outer_dst])?;
        let wants_ports = edit.src_port.is_some() || edit.dst_port.is_some();
        if wants_ports && embedded.transport == EmbeddedTransport::Other {
            return Err(EditError::NoPorts);
        }

        let region = self.l4;
        let mut icmp = ChecksumDelta::NONE;
        let (src_off, dst_off) = addr_offsets(self.family);

        // quoted addresses and IPv4 header checksum
        let ip = embedded.ip_offset;
        if let Some(src) = edit.src {
            self.replace_tracked(ip + src_off, &addr_bytes(src), region, &mut icmp);
        }
        if let Some(dst) = edit.dst {
            self.replace_tracked(ip + dst_off, &addr_bytes(dst), region, &mut icmp);
        }
        if self.family == IpFamily::V4 && (edit.src.is_some() || edit.dst.is_some()) {
            let ck = self.read_u16_at(ip + 10);
            let fixed = fix_embedded(ck, edit.ip_delta);
            self.replace_tracked(ip + 10, &fixed.to_be_bytes(), region, &mut icmp);
        }

        // quoted ports or identifier, then the quoted transport checksum
        let l4 = embedded.l4_offset;
        match embedded.transport {
            EmbeddedTransport::Ports { .. } => {
                if let Some(port) = edit.src_port {
                    self.replace_tracked(l4, &port.to_be_bytes(), region, &mut icmp);
                }
                if let Some(port) = edit.dst_port {
                    self.replace_tracked(l4 + 2, &port.to_be_bytes(), region, &mut icmp);
                }
            }
            EmbeddedTransport::IcmpQuery { .. } => {
                if let Some(id) = edit.src_port.or(edit.dst_port) {
                    self.replace_tracked(l4 + 4, &id.to_be_bytes(), region, &mut icmp);
                }
            }
            EmbeddedTransport::Other => {}
        }
        if embedded.transport != EmbeddedTransport::Other
            && let Some(off) = l4_checksum_offset(embedded.proto)
            && embedded.l4_captured >= off + 2
        {
            let ck = self.read_u16_at(l4 + off);
            let mut fixed = fix_embedded(ck, edit.l4_delta);
            if embedded.proto == NextHeader::UDP && ck != 0 && fixed == 0 {
                fixed = 0xffff;
            }
            self.replace_tracked(l4 + off, &fixed.to_be_bytes(), region, &mut icmp);
        }

        // the error's own addresses
        let mut outer_ip = ChecksumDelta::NONE;
        if let Some(src) = edit.outer_src {
            let old = self.src_addr();
            self.buf[src_off..src_off + addr_bytes(src).len()].copy_from_slice(&addr_bytes(src));
            outer_ip = outer_ip.combine(ChecksumDelta::from_addrs(old, src));
        }
        if let Some(dst) = edit.outer_dst {
            let old = self.dst_addr();
            self.buf[dst_off..dst_off + addr_bytes(dst).len()].copy_from_slice(&addr_bytes(dst));
            outer_ip = outer_ip.combine(ChecksumDelta::from_addrs(old, dst));
        }
        let outer_changed = edit.outer_src.is_some() || edit.outer_dst.is_some();
        match self.family {
            IpFamily::V4 if outer_changed => {
                let ck = self.read_u16_at(10);
                self.write_u16(10, edit.context.fix(ck, outer_ip));
            }
            // the ICMPv6 checksum covers the pseudo-header
            IpFamily::V6 => icmp = icmp.combine(outer_ip),
            IpFamily::V4 => {}
        }

        let ck = self.read_u16_at(region + 2);
        self.write_u16(region + 2, edit.context.fix(ck, icmp));

        self.refresh();
        self.meta.natted = true;
        Ok(())
    }
}
