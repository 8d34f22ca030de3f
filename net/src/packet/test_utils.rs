// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Builders for test datagrams, and from-scratch checksum computation to verify edits against.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::missing_panics_doc
)]

use super::{Packet, Transport, l4_checksum_offset};
use crate::checksum::{checksum, fold, sum_bytes};
use crate::ip::{IpFamily, NextHeader};
use crate::tcp::TcpFlags;
use etherparse::PacketBuilder;
use std::net::IpAddr;

fn builder(src: IpAddr, dst: IpAddr) -> etherparse::PacketBuilderStep<etherparse::IpHeaders> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => PacketBuilder::ipv4(src.octets(), dst.octets(), 64),
        (IpAddr::V6(src), IpAddr::V6(dst)) => PacketBuilder::ipv6(src.octets(), dst.octets(), 64),
        _ => panic!("mixed address families"),
    }
}

/// A TCP segment with the given control bits and a small payload.
#[must_use]
pub fn tcp_packet(src: IpAddr, sport: u16, dst: IpAddr, dport: u16, flags: TcpFlags) -> Packet {
    let mut tcp = builder(src, dst).tcp(sport, dport, 0x1000_0000, 4096);
    if flags.contains(TcpFlags::SYN) {
        tcp = tcp.syn();
    }
    if flags.contains(TcpFlags::ACK) {
        tcp = tcp.ack(0x2000_0000);
    }
    if flags.contains(TcpFlags::FIN) {
        tcp = tcp.fin();
    }
    if flags.contains(TcpFlags::RST) {
        tcp = tcp.rst();
    }
    if flags.contains(TcpFlags::PSH) {
        tcp = tcp.psh();
    }
    let payload = b"hello tcp";
    let mut buf = Vec::with_capacity(tcp.size(payload.len()));
    tcp.write(&mut buf, payload).unwrap();
    Packet::parse(buf).unwrap()
}

/// A UDP datagram with a small payload.
#[must_use]
pub fn udp_packet(src: IpAddr, sport: u16, dst: IpAddr, dport: u16) -> Packet {
    let udp = builder(src, dst).udp(sport, dport);
    let payload = b"hello udp!";
    let mut buf = Vec::with_capacity(udp.size(payload.len()));
    udp.write(&mut buf, payload).unwrap();
    Packet::parse(buf).unwrap()
}

/// An echo request (or reply) with identifier `id`.
#[must_use]
pub fn icmp_echo(src: IpAddr, dst: IpAddr, id: u16, seq: u16, reply: bool) -> Packet {
    let step = builder(src, dst);
    let payload = b"ping";
    let mut buf = Vec::new();
    match (IpFamily::of(&src), reply) {
        (IpFamily::V4, false) => step.icmpv4_echo_request(id, seq).write(&mut buf, payload),
        (IpFamily::V4, true) => step.icmpv4_echo_reply(id, seq).write(&mut buf, payload),
        (IpFamily::V6, false) => step.icmpv6_echo_request(id, seq).write(&mut buf, payload),
        (IpFamily::V6, true) => step.icmpv6_echo_reply(id, seq).write(&mut buf, payload),
    }
    .unwrap();
    Packet::parse(buf).unwrap()
}

/// A destination-unreachable error from `src` to `dst`, quoting the first `quote` bytes of
/// `offending`.
#[must_use]
pub fn icmp_unreachable(src: IpAddr, dst: IpAddr, offending: &Packet, quote: usize) -> Packet {
    let bytes = offending.as_bytes();
    let quoted = &bytes[..quote.min(offending.len())];
    let step = builder(src, dst);
    let mut buf = Vec::new();
    match IpFamily::of(&src) {
        // port unreachable
        IpFamily::V4 => step.icmpv4_raw(3, 3, [0; 4]).write(&mut buf, quoted),
        IpFamily::V6 => step.icmpv6_raw(1, 4, [0; 4]).write(&mut buf, quoted),
    }
    .unwrap();
    Packet::parse(buf).unwrap()
}

fn pseudo_header_sum(packet: &Packet, l4_len: usize) -> u32 {
    let mut sum = 0;
    for addr in [packet.src_addr(), packet.dst_addr()] {
        sum = match addr {
            IpAddr::V4(v4) => sum_bytes(sum, &v4.octets()),
            IpAddr::V6(v6) => sum_bytes(sum, &v6.octets()),
        };
    }
    let len = u32::try_from(l4_len).unwrap();
    sum_bytes(sum, &len.to_be_bytes()) + u32::from(packet.proto().to_u8())
}

/// The IPv4 header checksum a fresh computation yields (None for IPv6).
#[must_use]
pub fn recompute_ip_checksum(packet: &Packet) -> Option<u16> {
    if packet.family() != IpFamily::V4 {
        return None;
    }
    let mut hdr = packet.as_bytes()[..packet.l4_offset()].to_vec();
    hdr[10..12].copy_from_slice(&[0, 0]);
    Some(checksum(&hdr))
}

/// The transport checksum a fresh computation over the whole segment yields.
#[must_use]
pub fn recompute_l4_checksum(packet: &Packet) -> Option<u16> {
    let off = l4_checksum_offset(packet.proto())?;
    let mut segment = packet.as_bytes()[packet.l4_offset()..packet.len()].to_vec();
    segment[off..off + 2].copy_from_slice(&[0, 0]);
    let pseudo = match packet.proto() {
        NextHeader::ICMP => 0,
        _ => pseudo_header_sum(packet, segment.len()),
    };
    let ck = !fold(sum_bytes(pseudo, &segment));
    if packet.proto() == NextHeader::UDP && ck == 0 {
        return Some(0xffff);
    }
    Some(ck)
}

/// The quoted IPv4 header checksum of an ICMP error, recomputed.
#[must_use]
pub fn recompute_embedded_ip_checksum(packet: &Packet) -> Option<u16> {
    let Transport::IcmpError { embedded, .. } = packet.transport() else {
        return None;
    };
    if packet.family() != IpFamily::V4 {
        return None;
    }
    let mut hdr = packet.as_bytes()[embedded.ip_offset..embedded.l4_offset].to_vec();
    hdr[10..12].copy_from_slice(&[0, 0]);
    Some(checksum(&hdr))
}

/// The quoted IPv4 header checksum as stored.
#[must_use]
pub fn embedded_ip_checksum(packet: &Packet) -> Option<u16> {
    let Transport::IcmpError { embedded, .. } = packet.transport() else {
        return None;
    };
    let at = embedded.ip_offset + 10;
    Some(u16::from_be_bytes([packet.as_bytes()[at], packet.as_bytes()[at + 1]]))
}

/// Assert that every checksum of the datagram equals a from-scratch computation.
pub fn assert_checksums(packet: &Packet) {
    if let Some(ck) = recompute_ip_checksum(packet) {
        let stored = u16::from_be_bytes([packet.as_bytes()[10], packet.as_bytes()[11]]);
        assert_eq!(stored, ck, "IPv4 header checksum");
    }
    if let (Some(stored), Some(ck)) = (packet.l4_checksum(), recompute_l4_checksum(packet)) {
        assert_eq!(stored, ck, "transport checksum of {}", packet.proto());
    }
    if let (Some(stored), Some(ck)) = (
        embedded_ip_checksum(packet),
        recompute_embedded_ip_checksum(packet),
    ) {
        assert_eq!(stored, ck, "quoted IPv4 header checksum");
    }
}
